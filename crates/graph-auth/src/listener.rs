//! Transient loopback callback listener
//!
//! Hosts the OAuth redirect endpoint for the duration of one interactive
//! flow. A single armed slot holds the flow's oneshot sender; the first
//! matching callback takes it, so a late or duplicate callback gets a
//! "no sign-in in progress" page instead of resolving a stale flow.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use common::{Error, Result};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Signed in</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>Sign-in complete</h2>
<p>You can close this tab and return to the application.</p>
</body>
</html>"#;

const FAILURE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Sign-in failed</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>Sign-in failed</h2>
<p>The identity provider reported an error. Close this tab and try again.</p>
</body>
</html>"#;

const IDLE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>No sign-in in progress</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>No sign-in in progress</h2>
<p>This window arrived after the sign-in attempt ended. Close this tab.</p>
</body>
</html>"#;

/// What the provider delivered on the redirect.
#[derive(Debug)]
pub enum CallbackOutcome {
    Code { code: String, state: String },
    ProviderError { error: String, description: String },
}

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

/// One loopback HTTP server on the redirect URI's port.
///
/// The port is held only while the listener runs; `stop` releases it.
pub struct CallbackListener {
    slot: CallbackSlot,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl CallbackListener {
    /// Bind 127.0.0.1 on `port` (0 picks an ephemeral port) and serve the
    /// redirect `path`. Every other path answers 404.
    pub async fn start(port: u16, path: &str) -> Result<Self> {
        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let app = build_router(path, slot.clone());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Listener(format!("failed to bind 127.0.0.1:{port}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Listener(format!("listener has no local address: {e}")))?
            .port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "callback listener exited with error");
            }
        });
        debug!(port, path, "callback listener started");

        Ok(Self {
            slot,
            shutdown: Some(shutdown_tx),
            serve_task: Some(serve_task),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Arm the slot for one flow, returning the receiver the flow awaits.
    /// Re-arming drops any previous sender.
    pub async fn arm(&self) -> oneshot::Receiver<CallbackOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().await = Some(tx);
        rx
    }

    /// Drop any pending sender so a late callback cannot resolve the flow.
    pub async fn disarm(&self) {
        self.slot.lock().await.take();
    }

    /// Graceful shutdown, releasing the port. Idempotent.
    pub async fn stop(&mut self) {
        self.disarm().await;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
            debug!(port = self.port, "callback listener stopped");
        }
    }
}

fn build_router(path: &str, slot: CallbackSlot) -> Router {
    Router::new()
        .route(
            path,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let slot = slot.clone();
                async move { handle_callback(slot, params).await }
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
}

/// Always answers the browser with a static page; the flow outcome travels
/// over the armed oneshot.
async fn handle_callback(slot: CallbackSlot, params: HashMap<String, String>) -> Html<&'static str> {
    let outcome = if let Some(code) = params.get("code") {
        CallbackOutcome::Code {
            code: code.clone(),
            state: params.get("state").cloned().unwrap_or_default(),
        }
    } else if let Some(error) = params.get("error") {
        CallbackOutcome::ProviderError {
            error: error.clone(),
            description: params.get("error_description").cloned().unwrap_or_default(),
        }
    } else {
        CallbackOutcome::ProviderError {
            error: "invalid_callback".into(),
            description: "redirect carried neither code nor error".into(),
        }
    };

    let Some(sender) = slot.lock().await.take() else {
        debug!("callback arrived with no sign-in in progress");
        return Html(IDLE_PAGE);
    };

    let page = match &outcome {
        CallbackOutcome::Code { .. } => SUCCESS_PAGE,
        CallbackOutcome::ProviderError { error, .. } => {
            warn!(error, "provider delivered an error on the redirect");
            FAILURE_PAGE
        }
    };
    let _ = sender.send(outcome);
    Html(page)
}
