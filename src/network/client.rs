//! Peer Client
//!
//! HTTP client for calling other content nodes.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{peer_error, with_deadline, with_retry, PeerClient};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::replication::protocol::{
    BatchClockStatusRequest, BatchClockStatusResponse, ClockStatusResponse, SyncRequest, SyncResponse,
    SyncStatus, WalletExport,
};
use crate::state::UserClockStatus;

/// Extra time on top of the request timeout before the outer deadline fires
const DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// Peer client over HTTP
pub struct HttpPeerClient {
    http: reqwest::Client,
    /// Timeout for ordinary requests
    request_timeout: Duration,
    /// Timeout for exports, which can carry a full clock range
    export_timeout: Duration,
    /// Timeout for health checks
    health_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl HttpPeerClient {
    /// Create a new peer client
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            http,
            request_timeout: Duration::from_millis(config.peer_request_timeout_ms),
            export_timeout: Duration::from_millis(config.export_request_timeout_ms),
            health_timeout: Duration::from_millis(config.peer_health_check_timeout_ms),
            max_retries: config.peer_request_max_retries,
            retry_base_delay: Duration::from_millis(config.peer_request_retry_base_delay_ms),
        })
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        with_deadline(timeout + DEADLINE_SLACK, endpoint, async {
            let response = self.http.get(&url).query(query).timeout(timeout).send().await?;
            if !response.status().is_success() {
                return Err(peer_error(endpoint, response).await);
            }
            Ok(response.json::<T>().await?)
        })
        .await
    }

    async fn post_once<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        with_deadline(timeout + DEADLINE_SLACK, endpoint, async {
            let response = self.http.post(&url).json(body).timeout(timeout).send().await?;
            if !response.status().is_success() {
                return Err(peer_error(endpoint, response).await);
            }
            Ok(response.json::<T>().await?)
        })
        .await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T> {
        let this = self;
        with_retry(self.max_retries, self.retry_base_delay, path, move || {
            this.get_once(endpoint, path, query, timeout)
        })
        .await
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn health_check(&self, endpoint: &str) -> Result<()> {
        let _: serde_json::Value = self
            .get_once(endpoint, "/health_check", &[], self.health_timeout)
            .await?;
        Ok(())
    }

    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
        include_files_hash: bool,
    ) -> Result<Vec<UserClockStatus>> {
        let body = BatchClockStatusRequest {
            wallet_public_keys: wallets.to_vec(),
            include_files_hash,
        };
        let this = self;
        let body = &body;
        let response: BatchClockStatusResponse = with_retry(
            self.max_retries,
            self.retry_base_delay,
            "batch_clock_status",
            move || this.post_once(endpoint, "/users/batch_clock_status", body, this.request_timeout),
        )
        .await?;
        Ok(response.users)
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64> {
        let path = format!("/users/clock_status/{}", wallet);
        let response: ClockStatusResponse = self.get(endpoint, &path, &[], self.request_timeout).await?;
        Ok(response.clock)
    }

    async fn export(
        &self,
        endpoint: &str,
        wallet: &str,
        clock_range_min: u64,
        force_export: bool,
    ) -> Result<WalletExport> {
        let query = [
            ("wallet", wallet.to_string()),
            ("clock_range_min", clock_range_min.to_string()),
            ("force_export", force_export.to_string()),
        ];
        self.get(endpoint, "/export", &query, self.export_timeout).await
    }

    async fn issue_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<SyncResponse> {
        // Not retried: the caller's dedup and attempt accounting own re-issuance
        self.post_once(endpoint, "/sync", request, self.request_timeout).await
    }

    async fn sync_status(&self, endpoint: &str, sync_uuid: &str) -> Result<Option<SyncStatus>> {
        let path = format!("/sync_status/uuid/{}", sync_uuid);
        match self.get::<SyncStatus>(endpoint, &path, &[], self.request_timeout).await {
            Ok(status) => Ok(Some(status)),
            Err(crate::Error::Peer { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
