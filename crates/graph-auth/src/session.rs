//! OAuth session management
//!
//! `SessionManager` owns the token cache, the interactive browser flow, and
//! silent renewal. Exactly one interactive flow may run per process; a second
//! attempt fails fast instead of queueing. Flow coordination is channel-based:
//! the browser callback resolves a oneshot the flow awaits under a five-minute
//! timeout, after which the slot is disarmed so stale callbacks cannot land.
//!
//! `SessionFactory` is the process-wide context: construct it once at startup
//! and pass it by reference; the first `get_session` call builds the manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{Error, Result};
use graph_client::{ApiClient, RateLimiter, TokenSource};
use rand::RngExt;
use tokio::sync::{Mutex, OnceCell, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::listener::{CallbackListener, CallbackOutcome};
use crate::token;
use crate::token_store::TokenStore;

/// How long an interactive flow waits for the browser callback.
const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Cached tokens this close to expiry are treated as expired on silent reads,
/// covering clock skew and request latency.
const EXPIRY_SKEW_MILLIS: u64 = 120_000;

struct FlowState {
    in_progress: bool,
    listener: Option<CallbackListener>,
}

pub struct SessionManager {
    config: Config,
    http: reqwest::Client,
    store: TokenStore,
    flow: Mutex<FlowState>,
    client_handle: std::sync::Mutex<Option<Arc<ApiClient>>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        let store = TokenStore::new(config.oauth.token_cache_path.clone());
        Self {
            config,
            http: reqwest::Client::new(),
            store,
            flow: Mutex::new(FlowState {
                in_progress: false,
                listener: None,
            }),
            client_handle: std::sync::Mutex::new(None),
        }
    }

    /// Attempt silent acquisition once. Silent failures are swallowed; the
    /// only error here is a token cache that exists but cannot be read.
    pub async fn initialize(&self) -> Result<()> {
        self.store.ensure_readable().await?;
        if self.silent_acquire().await.is_some() {
            info!("session restored from cached tokens");
        }
        Ok(())
    }

    /// A usable access token without any user interaction, if one can be had:
    /// a cached unexpired token, or a successful refresh. Never errors; a
    /// failed attempt leaves the cache as it was and moves on.
    pub async fn silent_acquire(&self) -> Option<String> {
        self.silent_acquire_identity().await.map(|(_, token)| token)
    }

    async fn silent_acquire_identity(&self) -> Option<(String, String)> {
        for user_id in self.store.list_identities().await {
            let Some(record) = self.store.get(&user_id).await else {
                continue;
            };
            if !record.expires_within(EXPIRY_SKEW_MILLIS) {
                debug!(user_id, "using cached access token");
                return Some((user_id, record.access_token));
            }
            let Some(refresh) = record.refresh_token.clone() else {
                debug!(user_id, "cached token expired and no refresh token present");
                continue;
            };
            match self.redeem_refresh(&user_id, &refresh).await {
                Some(token) => return Some((user_id, token)),
                None => continue,
            }
        }
        None
    }

    /// Refresh one identity's tokens and persist the result. Returns the new
    /// access token, or None if the provider rejected the refresh.
    async fn redeem_refresh(&self, user_id: &str, refresh: &str) -> Option<String> {
        match token::refresh_token(&self.http, &self.config.oauth, refresh).await {
            Ok(response) => {
                let record = response
                    .into_record(&self.config.oauth.scope_string(), Some(refresh.to_string()));
                let access = record.access_token.clone();
                if let Err(e) = self.store.put(user_id, record).await {
                    warn!(user_id, error = %e, "failed to persist refreshed tokens");
                } else {
                    info!(user_id, "silently refreshed access token");
                }
                Some(access)
            }
            Err(e) => {
                debug!(user_id, error = %e, "token refresh rejected");
                None
            }
        }
    }

    /// Full sign-in: silent first, then the interactive browser flow.
    /// Resolves to the signed-in identity.
    pub async fn authenticate(&self) -> Result<String> {
        if let Some((user_id, _)) = self.silent_acquire_identity().await {
            return Ok(user_id);
        }

        // Build the URL before taking the flow guard so a construction
        // failure cannot leave the flow marked in progress.
        let state = generate_state();
        let url = self.build_authorize_url(&state)?;
        let rx = self.begin_flow().await?;
        info!(url = %url, "opening browser for interactive sign-in");
        if let Err(e) = open::that(&url) {
            warn!(error = %e, url = %url, "could not open a browser, visit the URL manually");
        }

        let result = self.await_callback(rx, &state).await;
        self.cleanup().await;
        result
    }

    /// Start the interactive flow but hand the authorization URL back instead
    /// of opening a browser. A background task completes the exchange when
    /// the callback arrives; poll [`Self::is_authenticated`] for completion.
    pub async fn auth_url(self: &Arc<Self>) -> Result<String> {
        let state = generate_state();
        let url = self.build_authorize_url(&state)?;
        let rx = self.begin_flow().await?;

        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.await_callback(rx, &state).await;
            manager.cleanup().await;
            match result {
                Ok(user_id) => info!(user_id, "background sign-in complete"),
                Err(e) => warn!(error = %e, "background sign-in failed"),
            }
        });

        Ok(url)
    }

    /// Redeem an authorization code, persist the tokens, and return the
    /// derived identity.
    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let response = token::exchange_code(&self.http, &self.config.oauth, code).await?;
        let record = response.into_record(&self.config.oauth.scope_string(), None);
        let user_id = token::derive_identity(&record);
        self.store.put(&user_id, record).await?;
        info!(user_id, "authentication complete");
        Ok(user_id)
    }

    /// A valid access token, escalating as needed: silent acquisition (or a
    /// forced refresh), then the full interactive flow.
    pub async fn get_access_token(&self, force_refresh: bool) -> Result<String> {
        let silent = if force_refresh {
            self.refresh_any().await
        } else {
            self.silent_acquire().await
        };
        if let Some(token) = silent {
            return Ok(token);
        }

        self.authenticate().await?;
        match self.silent_acquire().await {
            Some(token) => Ok(token),
            None => Err(Error::Authentication(
                "no access token available; run authenticate again".into(),
            )),
        }
    }

    /// Forced, non-interactive refresh. Used by the API client's 401
    /// recovery; never opens a browser.
    pub async fn refresh_access_token(&self) -> Result<String> {
        self.refresh_any().await.ok_or_else(|| {
            Error::Authentication("token refresh failed; run authenticate again".into())
        })
    }

    async fn refresh_any(&self) -> Option<String> {
        for user_id in self.store.list_identities().await {
            let Some(record) = self.store.get(&user_id).await else {
                continue;
            };
            let Some(refresh) = record.refresh_token.clone() else {
                continue;
            };
            if let Some(token) = self.redeem_refresh(&user_id, &refresh).await {
                return Some(token);
            }
        }
        None
    }

    /// Whether any identity has cached tokens. A presence check, not a
    /// validity check.
    pub async fn is_authenticated(&self) -> bool {
        !self.store.list_identities().await.is_empty()
    }

    /// Drop every cached identity. Returns whether anything was removed.
    pub async fn sign_out(&self) -> Result<bool> {
        self.client_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let removed = self.store.clear().await?;
        if removed {
            info!("signed out, token cache cleared");
        }
        Ok(removed)
    }

    /// Abort any interactive flow and release the listener port. Idempotent.
    pub async fn cleanup(&self) {
        let mut flow = self.flow.lock().await;
        flow.in_progress = false;
        if let Some(mut listener) = flow.listener.take() {
            listener.stop().await;
        }
    }

    /// The API client backed by this session, built lazily and reused.
    /// Sign-out drops the handle.
    pub fn client(self: &Arc<Self>) -> Arc<ApiClient> {
        let mut handle = self.client_handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = handle.as_ref() {
            return client.clone();
        }
        let limiter = RateLimiter::new(
            Duration::from_secs(self.config.api.rate_limit_window_secs),
            self.config.api.rate_limit_max_requests,
        );
        let client = Arc::new(ApiClient::new(
            self.config.api.base_url.clone(),
            self.clone() as Arc<dyn TokenSource>,
            limiter,
        ));
        *handle = Some(client.clone());
        client
    }

    /// Mark the flow in progress and arm the listener. Fails fast when a
    /// flow is already running.
    async fn begin_flow(&self) -> Result<oneshot::Receiver<CallbackOutcome>> {
        let mut flow = self.flow.lock().await;
        if flow.in_progress {
            return Err(Error::Authentication(
                "authentication already in progress".into(),
            ));
        }

        let (port, path) = self.config.oauth.redirect_parts()?;
        if flow.listener.is_none() {
            flow.listener = Some(CallbackListener::start(port, &path).await?);
        }
        let Some(listener) = flow.listener.as_ref() else {
            return Err(Error::Listener("callback listener unavailable".into()));
        };
        let rx = listener.arm().await;
        flow.in_progress = true;

        Ok(rx)
    }

    async fn await_callback(
        &self,
        rx: oneshot::Receiver<CallbackOutcome>,
        expected_state: &str,
    ) -> Result<String> {
        let outcome = match tokio::time::timeout(AUTH_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(Error::Listener("sign-in flow was cancelled".into())),
            Err(_) => {
                return Err(Error::Listener(format!(
                    "timed out after {}s waiting for the browser callback",
                    AUTH_TIMEOUT.as_secs()
                )));
            }
        };

        match outcome {
            CallbackOutcome::Code { code, state } => {
                if state != expected_state {
                    return Err(Error::Authentication(
                        "state mismatch on the OAuth callback".into(),
                    ));
                }
                self.exchange_code(&code).await
            }
            CallbackOutcome::ProviderError { error, description } => Err(Error::Listener(
                format!("provider returned {error}: {description}"),
            )),
        }
    }

    fn build_authorize_url(&self, state: &str) -> Result<String> {
        let oauth = &self.config.oauth;
        let mut url = Url::parse(&oauth.authorize_endpoint())
            .map_err(|e| Error::Config(format!("invalid authorize endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &oauth.client_id)
            .append_pair("redirect_uri", &oauth.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("scope", &oauth.scope_string())
            .append_pair("state", state);
        Ok(url.into())
    }
}

#[async_trait]
impl TokenSource for SessionManager {
    async fn bearer_token(&self, force_refresh: bool) -> Result<String> {
        if force_refresh {
            self.refresh_access_token().await
        } else {
            self.silent_acquire().await.ok_or_else(|| {
                Error::Authentication("not signed in; run authenticate first".into())
            })
        }
    }

    fn rate_limit_key(&self) -> String {
        self.config.oauth.client_id.clone()
    }
}

/// Opaque CSRF token carried through the authorization round trip.
fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Process-wide session context. The first `get_session` call constructs the
/// manager; later calls return the same instance and ignore their argument.
#[derive(Default)]
pub struct SessionFactory {
    session: OnceCell<Arc<SessionManager>>,
}

impl SessionFactory {
    pub fn new() -> Self {
        Self {
            session: OnceCell::new(),
        }
    }

    pub async fn get_session(&self, config: Config) -> Arc<SessionManager> {
        self.session
            .get_or_init(|| async move { Arc::new(SessionManager::new(config)) })
            .await
            .clone()
    }
}
