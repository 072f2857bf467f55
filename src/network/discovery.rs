//! Discovery Client
//!
//! Pages through the users a content node serves. Every attempt carries a
//! per-request timeout and a hard deadline; retryable failures are retried
//! with backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{peer_error, with_deadline, with_retry, Discovery};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::state::NodeUser;

#[derive(Debug, Deserialize)]
struct LatestUserIdResponse {
    latest_user_id: u64,
}

/// Discovery service client over HTTP
pub struct HttpDiscovery {
    http: reqwest::Client,
    base_url: String,
    hard_deadline: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl HttpDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            hard_deadline: Duration::from_millis(config.hard_deadline_ms),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    async fn latest_user_id_once(&self, url: &str) -> Result<u64> {
        with_deadline(self.hard_deadline, &self.base_url, async {
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(peer_error(&self.base_url, response).await);
            }
            let body: LatestUserIdResponse = response.json().await?;
            Ok(body.latest_user_id)
        })
        .await
    }

    async fn node_users_once(&self, url: &str, query: &[(&str, String)], max_users: usize) -> Result<Vec<NodeUser>> {
        with_deadline(self.hard_deadline, &self.base_url, async {
            let response = self.http.get(url).query(query).send().await?;
            if !response.status().is_success() {
                return Err(peer_error(&self.base_url, response).await);
            }
            let mut users: Vec<NodeUser> = response.json().await?;
            users.sort_by_key(|u| u.user_id);
            users.truncate(max_users);
            Ok(users)
        })
        .await
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn latest_user_id(&self) -> Result<u64> {
        let url = format!("{}/users/latest_id", self.base_url);
        let this = self;
        let url = url.as_str();
        with_retry(self.max_retries, self.retry_base_delay, "latest_user_id", move || {
            this.latest_user_id_once(url)
        })
        .await
    }

    async fn node_users(&self, endpoint: &str, prev_user_id: u64, max_users: usize) -> Result<Vec<NodeUser>> {
        let url = format!("{}/users/content_node", self.base_url);
        let query = [
            ("creator_node_endpoint", endpoint.to_string()),
            ("prev_user_id", prev_user_id.to_string()),
            ("max_users", max_users.to_string()),
        ];
        let this = self;
        let (url, query) = (url.as_str(), &query[..]);
        with_retry(self.max_retries, self.retry_base_delay, "node_users", move || {
            this.node_users_once(url, query, max_users)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Discovery node that answers 503 to the first `failures` calls
    async fn flaky_discovery(failures: u32) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));

        async fn respond(calls: &AtomicU32, failures: u32, body: Value) -> (StatusCode, Json<Value>) {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "warming up" })))
            } else {
                (StatusCode::OK, Json(body))
            }
        }

        let app = Router::new()
            .route(
                "/users/latest_id",
                get(move |State(calls): State<Arc<AtomicU32>>| async move {
                    respond(&calls, failures, json!({ "latest_user_id": 42 })).await
                }),
            )
            .route(
                "/users/content_node",
                get(move |State(calls): State<Arc<AtomicU32>>| async move {
                    let user = |user_id: u64| {
                        json!({
                            "user_id": user_id,
                            "wallet": format!("0x{}", user_id),
                            "primary": "http://cn1",
                            "secondary1": "http://cn2",
                            "secondary2": "http://cn3",
                            "primary_sp_id": 1,
                            "secondary1_sp_id": 2,
                            "secondary2_sp_id": 3,
                        })
                    };
                    respond(&calls, failures, json!([user(9), user(4)])).await
                }),
            )
            .with_state(Arc::clone(&calls));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}", addr), calls)
    }

    fn client(url: &str, max_retries: u32) -> HttpDiscovery {
        HttpDiscovery::new(&DiscoveryConfig {
            url: url.to_string(),
            request_timeout_ms: 2_000,
            hard_deadline_ms: 5_000,
            max_retries,
            retry_base_delay_ms: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_discovery_recovers_within_retry_budget() {
        let (url, calls) = flaky_discovery(2).await;
        let discovery = client(&url, 2);

        let users = discovery.node_users("http://cn1", 0, 10).await.unwrap();
        assert_eq!(users.iter().map(|u| u.user_id).collect::<Vec<_>>(), vec![4, 9]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(discovery.latest_user_id().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_discovery_gives_up_after_retry_budget() {
        let (url, calls) = flaky_discovery(5).await;
        let discovery = client(&url, 1);

        let err = discovery.latest_user_id().await.unwrap_err();
        assert!(matches!(err, crate::Error::Peer { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
