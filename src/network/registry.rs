//! Service registry client over an HTTP gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{peer_error, with_deadline, ServiceRegistry, WalletReplicaSet};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::state::{ContentNode, ReplicaSetSpIds};

#[derive(Debug, Serialize, Deserialize)]
struct UpdateReplicaSetBody {
    new: ReplicaSetSpIds,
    old: ReplicaSetSpIds,
}

pub struct HttpServiceRegistry {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpServiceRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn fetch(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        with_deadline(self.timeout * 2, &self.base_url, async {
            Ok(self.http.get(&url).send().await?)
        })
        .await
    }
}

#[async_trait]
impl ServiceRegistry for HttpServiceRegistry {
    async fn user_replica_set(&self, user_id: u64) -> Result<ReplicaSetSpIds> {
        let response = self.fetch(&format!("/users/{}/replica_set", user_id)).await?;
        if !response.status().is_success() {
            return Err(peer_error(&self.base_url, response).await);
        }
        Ok(response.json().await?)
    }

    async fn replica_set_for_wallet(&self, wallet: &str) -> Result<Option<WalletReplicaSet>> {
        let response = self.fetch(&format!("/wallets/{}/replica_set", wallet)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(peer_error(&self.base_url, response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn content_nodes(&self) -> Result<Vec<ContentNode>> {
        let response = self.fetch("/content_nodes").await?;
        if !response.status().is_success() {
            return Err(peer_error(&self.base_url, response).await);
        }
        Ok(response.json().await?)
    }

    async fn update_replica_set(&self, user_id: u64, new: ReplicaSetSpIds, old: ReplicaSetSpIds) -> Result<()> {
        let url = format!("{}/users/{}/replica_set", self.base_url, user_id);
        let body = UpdateReplicaSetBody { new, old };
        let response = with_deadline(self.timeout * 2, &self.base_url, async {
            Ok(self.http.post(&url).json(&body).send().await?)
        })
        .await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(Error::ReplicaSetChanged(format!(
                "registry rejected update for user {}: current replica set differs from {:?}",
                user_id, old
            )));
        }
        if !response.status().is_success() {
            return Err(peer_error(&self.base_url, response).await);
        }
        Ok(())
    }
}
