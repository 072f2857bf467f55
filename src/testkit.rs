//! In-process cluster of content nodes for tests.
//!
//! Every node gets its own ledger, ephemeral store and blob store; peer
//! calls are routed straight to the target node's handlers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::config::TriplicaConfig;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::monitor::{self, MonitorSnapshot};
use crate::network::{content_multihash, BlobStore, Discovery, PeerClient, ServiceRegistry, WalletReplicaSet};
use crate::replication::protocol::{SyncRequest, SyncResponse, SyncStatus, SyncTicket, WalletExport};
use crate::replication::{export_wallet, get_sync_status, secondary_sync_from_primary, SecondarySyncParams};
use crate::state::{
    ClockLedger, ContentNode, ImportBatch, MemoryStore, NewRow, NodeUser, ReplicaSet, ReplicaSetSpIds,
    UserClockStatus,
};

pub fn endpoint(n: usize) -> String {
    format!("http://cn{}", n)
}

fn unreachable(endpoint: &str) -> Error {
    Error::ConnectionFailed {
        address: endpoint.to_string(),
        reason: "node is down".into(),
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    users: Mutex<HashMap<String, WalletReplicaSet>>,
    nodes: Mutex<Vec<ContentNode>>,
    updates: Mutex<Vec<(u64, ReplicaSetSpIds)>>,
}

impl FakeRegistry {
    pub async fn add_node(&self, node: ContentNode) {
        self.nodes.lock().await.push(node);
    }

    pub async fn set_replica_set(&self, wallet: &str, user_id: u64, replica_set: ReplicaSet) {
        self.users
            .lock()
            .await
            .insert(wallet.to_string(), WalletReplicaSet { user_id, replica_set });
    }

    pub async fn replica_set_of(&self, wallet: &str) -> Option<WalletReplicaSet> {
        self.users.lock().await.get(wallet).cloned()
    }

    pub async fn update_count(&self) -> usize {
        self.updates.lock().await.len()
    }

    async fn sp_id_of(&self, endpoint: &str) -> Result<u64> {
        self.nodes
            .lock()
            .await
            .iter()
            .find(|n| n.endpoint == endpoint)
            .map(|n| n.sp_id)
            .ok_or_else(|| Error::NotFound(format!("content node {}", endpoint)))
    }

    async fn endpoint_of(&self, sp_id: u64) -> Result<String> {
        self.nodes
            .lock()
            .await
            .iter()
            .find(|n| n.sp_id == sp_id)
            .map(|n| n.endpoint.clone())
            .ok_or_else(|| Error::NotFound(format!("sp id {}", sp_id)))
    }
}

#[async_trait]
impl ServiceRegistry for FakeRegistry {
    async fn user_replica_set(&self, user_id: u64) -> Result<ReplicaSetSpIds> {
        let replica_set = self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.user_id == user_id)
            .map(|u| u.replica_set.clone())
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;
        Ok(ReplicaSetSpIds {
            primary: self.sp_id_of(&replica_set.primary).await?,
            secondary1: self.sp_id_of(&replica_set.secondary1).await?,
            secondary2: self.sp_id_of(&replica_set.secondary2).await?,
        })
    }

    async fn replica_set_for_wallet(&self, wallet: &str) -> Result<Option<WalletReplicaSet>> {
        Ok(self.replica_set_of(wallet).await)
    }

    async fn content_nodes(&self) -> Result<Vec<ContentNode>> {
        Ok(self.nodes.lock().await.clone())
    }

    async fn update_replica_set(&self, user_id: u64, new: ReplicaSetSpIds, old: ReplicaSetSpIds) -> Result<()> {
        if self.user_replica_set(user_id).await? != old {
            return Err(Error::ReplicaSetChanged(format!("user {}", user_id)));
        }
        let replica_set = ReplicaSet::new(
            self.endpoint_of(new.primary).await?,
            self.endpoint_of(new.secondary1).await?,
            self.endpoint_of(new.secondary2).await?,
        );

        let mut users = self.users.lock().await;
        if let Some(user) = users.values_mut().find(|u| u.user_id == user_id) {
            user.replica_set = replica_set;
        }
        drop(users);
        self.updates.lock().await.push((user_id, new));
        Ok(())
    }
}

/// Routes peer calls to in-process nodes
#[derive(Default)]
pub struct FakeNetwork {
    nodes: Mutex<HashMap<String, Weak<JobContext>>>,
    down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, &'static str)>>,
}

impl FakeNetwork {
    pub async fn register(&self, node: &Arc<JobContext>) {
        self.nodes
            .lock()
            .await
            .insert(node.self_endpoint().to_string(), Arc::downgrade(node));
    }

    pub async fn set_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down.lock().await;
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    pub async fn calls_to(&self, endpoint: &str, method: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(e, m)| e == endpoint && *m == method)
            .count()
    }

    async fn node(&self, endpoint: &str, method: &'static str) -> Result<Arc<JobContext>> {
        self.calls.lock().await.push((endpoint.to_string(), method));
        if self.down.lock().await.contains(endpoint) {
            return Err(unreachable(endpoint));
        }
        self.nodes
            .lock()
            .await
            .get(endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| unreachable(endpoint))
    }
}

#[async_trait]
impl PeerClient for FakeNetwork {
    async fn health_check(&self, endpoint: &str) -> Result<()> {
        self.node(endpoint, "health_check").await.map(|_| ())
    }

    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
        include_files_hash: bool,
    ) -> Result<Vec<UserClockStatus>> {
        let node = self.node(endpoint, "batch_clock_status").await?;
        node.ledger.batch_clock_status(wallets, include_files_hash).await
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64> {
        let node = self.node(endpoint, "clock_status").await?;
        node.ledger.clock(wallet).await
    }

    async fn export(
        &self,
        endpoint: &str,
        wallet: &str,
        clock_range_min: u64,
        force_export: bool,
    ) -> Result<WalletExport> {
        let node = self.node(endpoint, "export").await?;
        let max_range = node.config.sync.max_export_clock_value_range;
        export_wallet(&node.ledger, wallet, clock_range_min, force_export, max_range).await
    }

    /// Runs every requested sync to completion before returning, immediate or not
    async fn issue_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<SyncResponse> {
        let node = self.node(endpoint, "issue_sync").await?;
        let mut syncs = Vec::with_capacity(request.wallet.len());
        for params in SecondarySyncParams::from_request(request)? {
            let outcome = secondary_sync_from_primary(&node, &params).await;
            syncs.push(SyncTicket {
                wallet: params.wallet,
                sync_uuid: params.sync_uuid,
                result: Some(outcome.result),
            });
        }
        Ok(SyncResponse { syncs })
    }

    async fn sync_status(&self, endpoint: &str, sync_uuid: &str) -> Result<Option<SyncStatus>> {
        let node = self.node(endpoint, "sync_status").await?;
        get_sync_status(node.store.as_ref(), sync_uuid).await
    }
}

/// Blob store fetching from other in-process nodes
pub struct FakeBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    network: Arc<FakeNetwork>,
}

impl FakeBlobStore {
    pub fn new(network: Arc<FakeNetwork>) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            network,
        }
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn fetch_and_save(&self, multihash: &str, gateways: &[String]) -> Result<()> {
        for gateway in gateways {
            let Ok(node) = self.network.node(gateway, "fetch_blob").await else {
                continue;
            };
            if let Some(bytes) = node.blobs.read(multihash).await? {
                self.blobs.lock().await.insert(multihash.to_string(), bytes);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("blob {}", multihash)))
    }

    async fn contains(&self, multihash: &str) -> Result<bool> {
        Ok(self.blobs.lock().await.contains_key(multihash))
    }

    async fn read(&self, multihash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(multihash).cloned())
    }

    async fn save(&self, bytes: &[u8]) -> Result<String> {
        let multihash = content_multihash(bytes);
        self.blobs.lock().await.insert(multihash.clone(), bytes.to_vec());
        Ok(multihash)
    }

    async fn delete(&self, multihashes: &[String]) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        for multihash in multihashes {
            blobs.remove(multihash);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    users: Mutex<Vec<NodeUser>>,
    failing: AtomicBool,
}

impl FakeDiscovery {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn upsert(&self, user: NodeUser) {
        let mut users = self.users.lock().await;
        users.retain(|u| u.user_id != user.user_id);
        users.push(user);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network("discovery unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn latest_user_id(&self) -> Result<u64> {
        self.check()?;
        Ok(self.users.lock().await.iter().map(|u| u.user_id).max().unwrap_or(0))
    }

    async fn node_users(&self, endpoint: &str, prev_user_id: u64, max_users: usize) -> Result<Vec<NodeUser>> {
        self.check()?;
        let mut users: Vec<NodeUser> = self
            .users
            .lock()
            .await
            .iter()
            .filter(|u| u.user_id > prev_user_id && u.replica_set().contains(endpoint))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.user_id);
        users.truncate(max_users);
        Ok(users)
    }
}

pub struct TestCluster {
    pub registry: Arc<FakeRegistry>,
    pub network: Arc<FakeNetwork>,
    pub discovery: Arc<FakeDiscovery>,
    nodes: Vec<Arc<JobContext>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    pub async fn new() -> Self {
        Self::with_nodes(3, |_| {}).await
    }

    pub async fn with_config(configure: impl Fn(&mut TriplicaConfig)) -> Self {
        Self::with_nodes(3, configure).await
    }

    pub async fn with_nodes(count: usize, configure: impl Fn(&mut TriplicaConfig)) -> Self {
        let registry = Arc::new(FakeRegistry::default());
        let network = Arc::new(FakeNetwork::default());
        let discovery = Arc::new(FakeDiscovery::default());
        let mut nodes = Vec::with_capacity(count);
        let mut dirs = Vec::with_capacity(count);

        for n in 1..=count {
            let dir = TempDir::new().unwrap();
            let mut config = TriplicaConfig::from_str(&node_config(n, dir.path())).unwrap();
            configure(&mut config);

            let ledger = Arc::new(ClockLedger::open(config.data_dir()).unwrap());
            let ctx = Arc::new(
                JobContext::new(
                    config,
                    ledger,
                    Arc::new(MemoryStore::new()),
                    Arc::new(FakeBlobStore::new(Arc::clone(&network))),
                    Arc::clone(&registry) as Arc<dyn ServiceRegistry>,
                    Arc::clone(&network) as Arc<dyn PeerClient>,
                    Arc::clone(&discovery) as Arc<dyn Discovery>,
                )
                .unwrap(),
            );
            network.register(&ctx).await;
            registry
                .add_node(ContentNode {
                    sp_id: n as u64,
                    endpoint: endpoint(n),
                    delegate_public_key: ctx.signer.public_key_hex(),
                })
                .await;
            nodes.push(ctx);
            dirs.push(dir);
        }

        Self {
            registry,
            network,
            discovery,
            nodes,
            _dirs: dirs,
        }
    }

    /// Node `n`, counting from 1
    pub fn node(&self, n: usize) -> Arc<JobContext> {
        Arc::clone(&self.nodes[n - 1])
    }

    /// Register a user with the registry and discovery
    pub async fn add_user(&self, user_id: u64, wallet: &str, replicas: [usize; 3]) -> NodeUser {
        let [p, s1, s2] = replicas;
        let user = NodeUser {
            user_id,
            wallet: wallet.to_string(),
            primary: endpoint(p),
            secondary1: endpoint(s1),
            secondary2: endpoint(s2),
            primary_sp_id: p as u64,
            secondary1_sp_id: s1 as u64,
            secondary2_sp_id: s2 as u64,
        };
        self.registry.set_replica_set(wallet, user_id, user.replica_set()).await;
        self.discovery.upsert(user.clone()).await;
        user
    }

    /// Append `count` rows to node `n`, each referencing a fresh blob stored there
    pub async fn write_rows(&self, n: usize, wallet: &str, count: usize) {
        let node = self.node(n);
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let body = uuid::Uuid::new_v4().to_string();
            let multihash = node.blobs.save(body.as_bytes()).await.unwrap();
            rows.push(NewRow::new("files", json!({ "body": body, "written_on": n })).with_multihash(multihash));
        }
        node.ledger.append_batch(wallet, rows).await.unwrap();
    }

    /// Replicate clocks `1..=upto` of a wallet from one node to another, rows only
    pub async fn copy_ledger(&self, from: usize, to: usize, wallet: &str, upto: u64) {
        let source = self.node(from);
        let target = self.node(to);
        let export = export_wallet(&source.ledger, wallet, 1, false, upto).await.unwrap();
        let batch = ImportBatch {
            wallet: wallet.to_string(),
            expected_local_clock: target.ledger.clock(wallet).await.unwrap(),
            clock: export.clock,
            clock_records: export.clock_records,
            rows: export.rows,
        };
        target.ledger.import_batch(&batch).await.unwrap();
    }

    /// Monitor snapshot of every user node `n` serves
    pub async fn snapshot(&self, n: usize) -> MonitorSnapshot {
        let node = self.node(n);
        let users = self
            .discovery
            .node_users(node.self_endpoint(), 0, usize::MAX)
            .await
            .unwrap();
        monitor::build_snapshot(&node, users).await.unwrap()
    }
}

fn node_config(n: usize, data_dir: &std::path::Path) -> String {
    format!(
        r#"
[node]
endpoint = "{endpoint}"
sp_id = {n}
delegate_private_key = "{key}"
data_dir = "{data_dir}"

[registry]
url = "http://registry.test"

[discovery]
url = "http://discovery.test"

[sync]
sync_monitoring_retry_delay_ms = 5
max_manual_sync_monitoring_duration_ms = 200
max_recurring_sync_monitoring_duration_ms = 200
peer_request_retry_base_delay_ms = 1

[monitor]
monitor_interval_ms = 50
peer_sp_id_map_refresh_ms = 200
"#,
        endpoint = endpoint(n),
        key = hex::encode([n as u8; 32]),
        data_dir = data_dir.display(),
    )
}
