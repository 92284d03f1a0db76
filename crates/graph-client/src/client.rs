//! Authenticated API client
//!
//! Injects bearer tokens from a [`TokenSource`], enforces the local rate
//! limiter, and maps provider responses onto the workspace error taxonomy.
//! Exactly one forced token refresh is attempted on a 401; throttling (429)
//! and transport failures are never retried internally.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Error, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::rate_limit::RateLimiter;

/// Throttle delay assumed when the provider omits Retry-After.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Where bearer tokens come from.
///
/// `force_refresh` means the previous token was rejected: the source must
/// renew it without user interaction, or fail.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self, force_refresh: bool) -> Result<String>;

    /// Key under which this source's requests are counted by the limiter.
    fn rate_limit_key(&self) -> String;
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    limiter: RateLimiter,
}

enum Attempt {
    Success(Value),
    Unauthorized,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        limiter: RateLimiter,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            tokens,
            limiter,
        }
    }

    pub async fn get(&self, endpoint: &str, query: Option<&[(&str, &str)]>) -> Result<Value> {
        let url = self.endpoint_url(endpoint, query)?;
        self.request(Method::GET, url, None).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: &Value,
        query: Option<&[(&str, &str)]>,
    ) -> Result<Value> {
        let url = self.endpoint_url(endpoint, query)?;
        self.request(Method::POST, url, Some(body)).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: &Value,
        query: Option<&[(&str, &str)]>,
    ) -> Result<Value> {
        let url = self.endpoint_url(endpoint, query)?;
        self.request(Method::PATCH, url, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str, query: Option<&[(&str, &str)]>) -> Result<Value> {
        let url = self.endpoint_url(endpoint, query)?;
        self.request(Method::DELETE, url, None).await
    }

    /// Follow an absolute URL handed back by the provider (pagination links).
    pub(crate) async fn get_absolute(&self, url: &str) -> Result<Value> {
        let url = Url::parse(url)
            .map_err(|e| Error::Network(format!("invalid continuation URL {url}: {e}")))?;
        self.request(Method::GET, url, None).await
    }

    fn endpoint_url(&self, endpoint: &str, query: Option<&[(&str, &str)]>) -> Result<Url> {
        let path = endpoint.trim_start_matches('/');
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        if let Some(pairs) = query {
            let mut query_pairs = url.query_pairs_mut();
            for (name, value) in pairs {
                query_pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let token = self.tokens.bearer_token(false).await?;
        match self.attempt(&method, &url, &token, body).await? {
            Attempt::Success(value) => Ok(value),
            Attempt::Unauthorized => {
                debug!(path = url.path(), "provider returned 401, forcing a token refresh");
                let token = self.tokens.bearer_token(true).await.map_err(|e| match e {
                    Error::Authentication(msg) => Error::Authentication(msg),
                    other => Error::Authentication(format!("token refresh failed: {other}")),
                })?;
                match self.attempt(&method, &url, &token, body).await? {
                    Attempt::Success(value) => Ok(value),
                    Attempt::Unauthorized => Err(Error::Authentication(
                        "request rejected again after a token refresh; sign in again".into(),
                    )),
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Attempt> {
        self.limiter.check(&self.tokens.rate_limit_key())?;

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = retry_after_secs(&response);
            warn!(retry_after_secs, "provider throttled the request");
            return Err(Error::Throttled { retry_after_secs });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                code: error_code(&body_text),
                body: body_text,
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Attempt::Success(Value::Null));
        }
        let value = serde_json::from_str(&body_text).map_err(|e| Error::Api {
            status: status.as_u16(),
            code: None,
            body: format!("response is not valid JSON: {e}"),
        })?;
        Ok(Attempt::Success(value))
    }
}

fn retry_after_secs(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Extract the machine-readable code from a `{"error":{"code":...}}` body.
fn error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("code")?
        .as_str()
        .map(str::to_string)
}
