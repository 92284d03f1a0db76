//! Workspace-wide error taxonomy
//!
//! One enum covers every layer: auth flow, token cache, rate limiting, and
//! API transport. Variants carry the data callers dispatch on (retry delays,
//! HTTP status) instead of encoding it in the message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Interactive or silent authentication failed. The message tells the
    /// user what to do next.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The token endpoint rejected a code exchange or refresh.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Local client-side quota exhausted for the current window.
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The provider answered 429. Never retried internally.
    #[error("Request throttled by provider, retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    /// Any other non-success API response.
    #[error("API error {status}{}: {body}", fmt_code(.code))]
    Api {
        status: u16,
        code: Option<String>,
        body: String,
    },

    /// The request never produced an HTTP response.
    #[error("Network error: {0}")]
    Network(String),

    /// Callback listener failed: bind error, timeout, or a provider error
    /// delivered on the redirect.
    #[error("Callback listener error: {0}")]
    Listener(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Token cache state could not be serialized for writing. Read-side
    /// corruption is not an error; readers treat an unparseable file as empty.
    #[error("Token cache serialization error: {0}")]
    CacheSerialize(String),
}

fn fmt_code(code: &Option<String>) -> String {
    match code {
        Some(code) => format!(" ({code})"),
        None => String::new(),
    }
}

/// Result alias using the workspace Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let auth = Error::Authentication("not signed in".into());
        assert_eq!(auth.to_string(), "Authentication error: not signed in");

        let limited = Error::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(limited.to_string(), "Rate limit exceeded, retry in 42s");
    }

    #[test]
    fn api_error_display_includes_code_when_present() {
        let with_code = Error::Api {
            status: 403,
            code: Some("ErrorAccessDenied".into()),
            body: "denied".into(),
        };
        assert_eq!(
            with_code.to_string(),
            "API error 403 (ErrorAccessDenied): denied"
        );

        let without_code = Error::Api {
            status: 500,
            code: None,
            body: "boom".into(),
        };
        assert_eq!(without_code.to_string(), "API error 500: boom");
    }

    #[test]
    fn error_debug_includes_variant() {
        let err = Error::Throttled {
            retry_after_secs: 30,
        };
        let debug = format!("{:?}", err);
        assert!(
            debug.contains("Throttled"),
            "Debug should include variant name, got: {debug}"
        );
    }
}
