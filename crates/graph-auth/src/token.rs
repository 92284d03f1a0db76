//! Token endpoint interactions
//!
//! Two form-encoded POSTs to `{authority}/oauth2/v2.0/token`:
//! 1. Authorization code exchange (completing the interactive flow)
//! 2. Refresh grant (silent renewal)
//!
//! Confidential clients include `client_secret` in the form; public clients
//! omit it. Also derives the store identity for a freshly minted record.

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{Error, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::OauthConfig;
use crate::token_store::{TokenRecord, now_millis};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time; it becomes an
/// absolute unix millisecond timestamp when the record is stored.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_expires_in() -> u64 {
    3600
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl TokenResponse {
    /// Build the storable record. `previous_refresh` is carried forward when
    /// the provider omits a new refresh token (common on refresh grants).
    pub fn into_record(self, fallback_scope: &str, previous_refresh: Option<String>) -> TokenRecord {
        TokenRecord {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            id_token: self.id_token,
            expires_at: now_millis().saturating_add(self.expires_in.saturating_mul(1000)),
            scope: self.scope.unwrap_or_else(|| fallback_scope.to_string()),
            token_type: self.token_type,
        }
    }
}

/// Exchange an authorization code for tokens (completing the browser flow).
pub async fn exchange_code(
    client: &reqwest::Client,
    oauth: &OauthConfig,
    code: &str,
) -> Result<TokenResponse> {
    let scope = oauth.scope_string();
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", oauth.client_id.as_str()),
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", oauth.redirect_uri.as_str()),
        ("scope", scope.as_str()),
    ];
    if let Some(ref secret) = oauth.client_secret {
        form.push(("client_secret", secret.expose()));
    }
    post_token_request(client, &oauth.token_endpoint(), &form, "token exchange").await
}

/// Redeem a refresh token for a new access token.
pub async fn refresh_token(
    client: &reqwest::Client,
    oauth: &OauthConfig,
    refresh: &str,
) -> Result<TokenResponse> {
    let scope = oauth.scope_string();
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", oauth.client_id.as_str()),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("scope", scope.as_str()),
    ];
    if let Some(ref secret) = oauth.client_secret {
        form.push(("client_secret", secret.expose()));
    }
    post_token_request(client, &oauth.token_endpoint(), &form, "token refresh").await
}

async fn post_token_request(
    client: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
    context: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(form)
        .send()
        .await
        .map_err(|e| Error::Network(format!("{context} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "{context} returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid {context} response: {e}")))
}

/// Store key for a record: a human-readable claim from the id token when
/// present, otherwise a stable digest of the access token.
pub fn derive_identity(record: &TokenRecord) -> String {
    if let Some(ref id_token) = record.id_token {
        if let Some(identity) = identity_from_id_token(id_token) {
            return identity;
        }
    }

    let digest = Sha256::digest(record.access_token.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("user-{hex}")
}

/// Decode the JWT payload (no signature check; the token arrived over TLS
/// from the token endpoint) and pick the best identity claim.
fn identity_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    for claim in ["preferred_username", "email", "upn", "sub"] {
        if let Some(value) = claims.get(claim).and_then(|v| v.as_str()) {
            if !value.trim().is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::net::TcpListener;

    fn test_oauth(authority_url: &str, secret: Option<&str>) -> OauthConfig {
        OauthConfig {
            client_id: "app-id".into(),
            client_secret: secret.map(common::Secret::new),
            client_secret_file: None,
            authority_url: authority_url.into(),
            redirect_uri: "http://localhost:8400/callback".into(),
            scopes: vec!["Mail.Read".into(), "offline_access".into()],
            token_cache_path: std::env::temp_dir().join("unused.json"),
        }
    }

    fn make_id_token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    /// Echo the posted form back inside a valid token response so tests can
    /// assert on the exact fields sent.
    async fn start_token_server(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(move |request: Request<Body>| async move {
                let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
                    .await
                    .unwrap();
                let form = String::from_utf8_lossy(&body).to_string();
                let response = serde_json::json!({
                    "access_token": format!("at|{form}"),
                    "refresh_token": "rt_new",
                    "expires_in": 3600,
                    "token_type": "Bearer",
                });
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    axum::Json(response),
                )
            });
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        format!("http://{addr}")
    }

    #[test]
    fn token_response_applies_defaults() {
        let json = r#"{"access_token":"at_abc"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn into_record_computes_absolute_expiry() {
        let before = now_millis();
        let token = TokenResponse {
            access_token: "at_abc".into(),
            refresh_token: Some("rt_def".into()),
            id_token: None,
            expires_in: 3600,
            scope: Some("Mail.Read".into()),
            token_type: "Bearer".into(),
        };
        let record = token.into_record("fallback", None);
        let after = now_millis();

        assert!(record.expires_at >= before + 3_600_000);
        assert!(record.expires_at <= after + 3_600_000);
        assert_eq!(record.scope, "Mail.Read");
    }

    #[test]
    fn into_record_carries_forward_previous_refresh_token() {
        let token = TokenResponse {
            access_token: "at_abc".into(),
            refresh_token: None,
            id_token: None,
            expires_in: 3600,
            scope: None,
            token_type: "Bearer".into(),
        };
        let record = token.into_record("Mail.Read", Some("rt_old".into()));
        assert_eq!(record.refresh_token.as_deref(), Some("rt_old"));
        assert_eq!(record.scope, "Mail.Read");
    }

    #[test]
    fn into_record_prefers_new_refresh_token() {
        let token = TokenResponse {
            access_token: "at_abc".into(),
            refresh_token: Some("rt_new".into()),
            id_token: None,
            expires_in: 3600,
            scope: None,
            token_type: "Bearer".into(),
        };
        let record = token.into_record("Mail.Read", Some("rt_old".into()));
        assert_eq!(record.refresh_token.as_deref(), Some("rt_new"));
    }

    #[test]
    fn derive_identity_prefers_id_token_claims() {
        let id_token = make_id_token(serde_json::json!({
            "preferred_username": "user@example.com",
            "sub": "opaque-subject",
        }));
        let record = TokenRecord {
            access_token: "at_abc".into(),
            refresh_token: None,
            id_token: Some(id_token),
            expires_at: 0,
            scope: String::new(),
            token_type: "Bearer".into(),
        };
        assert_eq!(derive_identity(&record), "user@example.com");
    }

    #[test]
    fn derive_identity_falls_back_through_claims() {
        let id_token = make_id_token(serde_json::json!({ "sub": "opaque-subject" }));
        let record = TokenRecord {
            access_token: "at_abc".into(),
            refresh_token: None,
            id_token: Some(id_token),
            expires_at: 0,
            scope: String::new(),
            token_type: "Bearer".into(),
        };
        assert_eq!(derive_identity(&record), "opaque-subject");
    }

    #[test]
    fn derive_identity_digest_is_stable_without_id_token() {
        let record = TokenRecord {
            access_token: "at_abc".into(),
            refresh_token: None,
            id_token: None,
            expires_at: 0,
            scope: String::new(),
            token_type: "Bearer".into(),
        };
        let first = derive_identity(&record);
        let second = derive_identity(&record);
        assert_eq!(first, second);
        assert!(first.starts_with("user-"), "got {first}");
        assert_eq!(first.len(), "user-".len() + 16);
    }

    #[tokio::test]
    async fn exchange_code_posts_the_authorization_grant() {
        let base = start_token_server(200).await;
        let oauth = test_oauth(&base, None);
        let client = reqwest::Client::new();

        let token = exchange_code(&client, &oauth, "abc123").await.unwrap();
        let form = token.access_token.strip_prefix("at|").unwrap().to_string();
        assert!(form.contains("grant_type=authorization_code"), "{form}");
        assert!(form.contains("code=abc123"), "{form}");
        assert!(form.contains("client_id=app-id"), "{form}");
        assert!(
            form.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8400%2Fcallback"),
            "{form}"
        );
        assert!(form.contains("scope=Mail.Read+offline_access"), "{form}");
        assert!(!form.contains("client_secret"), "{form}");
    }

    #[tokio::test]
    async fn exchange_code_includes_secret_for_confidential_clients() {
        let base = start_token_server(200).await;
        let oauth = test_oauth(&base, Some("s3cr3t"));
        let client = reqwest::Client::new();

        let token = exchange_code(&client, &oauth, "abc123").await.unwrap();
        assert!(token.access_token.contains("client_secret=s3cr3t"));
    }

    #[tokio::test]
    async fn refresh_posts_the_refresh_grant() {
        let base = start_token_server(200).await;
        let oauth = test_oauth(&base, None);
        let client = reqwest::Client::new();

        let token = refresh_token(&client, &oauth, "rt_old").await.unwrap();
        let form = token.access_token.strip_prefix("at|").unwrap().to_string();
        assert!(form.contains("grant_type=refresh_token"), "{form}");
        assert!(form.contains("refresh_token=rt_old"), "{form}");
        assert!(!form.contains("redirect_uri"), "{form}");
    }

    #[tokio::test]
    async fn non_success_status_is_a_token_exchange_error() {
        let base = start_token_server(400).await;
        let oauth = test_oauth(&base, None);
        let client = reqwest::Client::new();

        let err = exchange_code(&client, &oauth, "bad-code").await.unwrap_err();
        match err {
            Error::TokenExchange(msg) => assert!(msg.contains("400"), "got: {msg}"),
            other => panic!("expected TokenExchange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let oauth = test_oauth(&format!("http://{addr}"), None);
        let client = reqwest::Client::new();
        let err = refresh_token(&client, &oauth, "rt_old").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got {err:?}");
    }
}
