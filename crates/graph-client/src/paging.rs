//! Cursor pagination over `@odata.nextLink`
//!
//! Each page carries its items in a `value` array and an optional absolute
//! continuation URL. The page cap bounds runaway cursors; hitting it returns
//! the partial result rather than an error.

use common::Result;
use serde_json::Value;
use tracing::warn;

use crate::client::ApiClient;

pub const DEFAULT_MAX_PAGES: u32 = 10;

#[derive(Clone, Copy, Debug)]
pub struct PageOptions {
    pub max_pages: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl ApiClient {
    /// GET `endpoint` and follow continuation links, accumulating every
    /// page's `value` items in order.
    pub async fn get_paginated(
        &self,
        endpoint: &str,
        query: Option<&[(&str, &str)]>,
        options: PageOptions,
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = self.get(endpoint, query).await?;
        let mut fetched: u32 = 1;

        loop {
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            let Some(next) = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                break;
            };
            if fetched >= options.max_pages {
                warn!(
                    fetched,
                    max_pages = options.max_pages,
                    "pagination stopped at the page cap, returning partial results"
                );
                break;
            }
            page = self.get_absolute(&next).await?;
            fetched += 1;
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::net::TcpListener;

    use crate::client::TokenSource;
    use crate::rate_limit::RateLimiter;

    struct FixedToken;

    #[async_trait]
    impl TokenSource for FixedToken {
        async fn bearer_token(&self, _force_refresh: bool) -> common::Result<String> {
            Ok("token-1".into())
        }

        fn rate_limit_key(&self) -> String {
            "test-user".into()
        }
    }

    /// Serve three pages of items (2, 2, 1) chained by `@odata.nextLink`,
    /// counting requests.
    async fn start_paged_server(hits: Arc<AtomicU32>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{addr}");

        let handler_base = base.clone();
        tokio::spawn(async move {
            let app = Router::new().fallback(move |request: Request<Body>| {
                let base = handler_base.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let page: u32 = request
                        .uri()
                        .query()
                        .and_then(|q| q.strip_prefix("page="))
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(1);
                    let body = match page {
                        1 => serde_json::json!({
                            "value": ["a1", "a2"],
                            "@odata.nextLink": format!("{base}/items?page=2"),
                        }),
                        2 => serde_json::json!({
                            "value": ["b1", "b2"],
                            "@odata.nextLink": format!("{base}/items?page=3"),
                        }),
                        _ => serde_json::json!({ "value": ["c1"] }),
                    };
                    axum::Json(body)
                }
            });
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        base
    }

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Arc::new(FixedToken), RateLimiter::default())
    }

    #[tokio::test]
    async fn follows_next_links_and_accumulates_in_order() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = start_paged_server(hits.clone()).await;
        let api = client(&base);

        let items = api
            .get_paginated("/items", None, PageOptions::default())
            .await
            .unwrap();
        assert_eq!(items, vec!["a1", "a2", "b1", "b2", "c1"]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn page_cap_returns_partial_results() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = start_paged_server(hits.clone()).await;
        let api = client(&base);

        let items = api
            .get_paginated("/items", None, PageOptions { max_pages: 1 })
            .await
            .unwrap();
        assert_eq!(items, vec!["a1", "a2"]);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "cap stops further fetches");
    }

    #[tokio::test]
    async fn single_page_without_next_link_fetches_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let handler_hits = hits.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(move || {
                let hits = handler_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(serde_json::json!({ "value": ["only"] }))
                }
            });
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let api = client(&format!("http://{addr}"));
        let items = api
            .get_paginated("/items", None, PageOptions::default())
            .await
            .unwrap();
        assert_eq!(items, vec!["only"]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
