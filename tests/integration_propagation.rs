//! End-to-end coverage of the publish pipeline (`spec.md` §4.4, §7) against
//! in-memory fakes for the store/cert layers — the parts `graph/memory.rs`'s
//! own unit tests don't reach: signature verification, dedup, and the peer
//! tidy cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use propolis::bloom::BloomFilter;
use propolis::error::PropolisError;
use propolis::identity::cert::{CertCache, CertSource, CertStore};
use propolis::identity::NodeIdentity;
use propolis::model::{Action, PeerRecord, SeedRecord};
use propolis::observability::MetricsRegistry;
use propolis::persist::{ActionStore, PeerDirectory};
use propolis::propagation::{handle_publish, PublishContext, PublishOutcome};

struct FakeStore {
    actions: Mutex<HashMap<String, Action>>,
    peers: Mutex<HashMap<String, PeerRecord>>,
    seeds: Mutex<HashMap<String, SeedRecord>>,
    certs: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            seeds: Mutex::new(HashMap::new()),
            certs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl ActionStore for FakeStore {
    async fn try_insert(&self, action: &Action) -> Result<bool, PropolisError> {
        let mut guard = self.actions.lock().await;
        if guard.contains_key(&action.id) {
            return Ok(false);
        }
        guard.insert(action.id.clone(), action.clone());
        Ok(true)
    }
}

#[async_trait::async_trait]
impl PeerDirectory for FakeStore {
    async fn upsert_peer(&self, record: &PeerRecord) -> anyhow::Result<()> {
        self.peers.lock().await.insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_seed(&self, record: &SeedRecord) -> anyhow::Result<()> {
        self.seeds.lock().await.insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<PeerRecord>> {
        Ok(self.peers.lock().await.values().cloned().collect())
    }

    async fn list_seeds(&self) -> anyhow::Result<Vec<SeedRecord>> {
        Ok(self.seeds.lock().await.values().cloned().collect())
    }

    async fn remove_peer(&self, node_id: &str) -> anyhow::Result<()> {
        self.peers.lock().await.remove(node_id);
        Ok(())
    }

    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut peers = self.peers.lock().await;
        let before = peers.len();
        peers.retain(|_, p| p.updated_at >= cutoff);
        let mut seeds = self.seeds.lock().await;
        let before_seeds = seeds.len();
        seeds.retain(|_, s| s.updated_at >= cutoff);
        Ok(((before - peers.len()) + (before_seeds - seeds.len())) as u64)
    }
}

#[async_trait::async_trait]
impl CertStore for FakeStore {
    async fn get_cert(&self, identifier: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.certs.lock().await.get(identifier).cloned())
    }

    async fn put_cert(&self, identifier: &str, der: &[u8]) -> anyhow::Result<()> {
        self.certs.lock().await.insert(identifier.to_string(), der.to_vec());
        Ok(())
    }
}

struct NeverSource;

#[async_trait::async_trait]
impl CertSource for NeverSource {
    async fn fetch_remote(&self, identifier: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no remote source configured for {identifier} in test")
    }
}

fn sign_action(identity: &NodeIdentity, action_id: &str, statement: &str) -> Action {
    let unsigned = Action {
        id: action_id.to_string(),
        timestamp: Utc::now(),
        identity: identity.node_id.clone(),
        remote_addr: "127.0.0.1:9000".to_string(),
        node_id: identity.node_id.clone(),
        action: statement.to_string(),
        encoded_signature: String::new(),
        received_from: Vec::new(),
    };
    let digest = unsigned.signed_digest();
    let mut signer = identity.signer();
    signer.update(&digest);
    let signature = signer.finalize();
    Action { encoded_signature: signature, ..unsigned }
}

async fn build_ctx(store: Arc<FakeStore>, identity: Arc<NodeIdentity>) -> Arc<PublishContext> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cert_cache = Arc::new(CertCache::new(store.clone(), Arc::new(NeverSource)));
    let (exec_tx, _exec_rx) = tokio::sync::mpsc::unbounded_channel();
    let client_endpoint = propolis::transport::client_endpoint().expect("client endpoint");
    Arc::new(PublishContext {
        node_identity: identity,
        action_store: store.clone(),
        peer_directory: store.clone(),
        cert_cache,
        interest_filter: Arc::new(BloomFilter::new()),
        exec_tx,
        client_endpoint,
        metrics: Arc::new(MetricsRegistry::new()),
    })
}

#[tokio::test]
async fn republishing_the_same_action_id_is_a_duplicate() {
    let identity = Arc::new(NodeIdentity::generate("node-a").unwrap());
    let store = Arc::new(FakeStore::new());
    store.put_cert("node-a", &identity.cert_der).await.unwrap();
    let ctx = build_ctx(store, identity.clone()).await;

    let action = sign_action(&identity, "action-1", "MERGE (n {id: 'x'})");

    let first = handle_publish(&ctx, action.clone()).await;
    assert!(matches!(first, PublishOutcome::Accepted));

    let second = handle_publish(&ctx, action).await;
    assert!(matches!(second, PublishOutcome::Duplicate));
}

#[tokio::test]
async fn tampered_statement_fails_signature_verification() {
    let identity = Arc::new(NodeIdentity::generate("node-a").unwrap());
    let store = Arc::new(FakeStore::new());
    store.put_cert("node-a", &identity.cert_der).await.unwrap();
    let ctx = build_ctx(store, identity.clone()).await;

    let mut action = sign_action(&identity, "action-2", "MERGE (n {id: 'x'})");
    action.action = "MERGE (n {id: 'y'})".to_string();

    let outcome = handle_publish(&ctx, action).await;
    match outcome {
        PublishOutcome::Rejected { status, .. } => assert_eq!(status, 400),
        other => panic!("expected a rejection, got a {} status", other.status()),
    }
}

#[tokio::test]
async fn unknown_signer_is_rejected_as_unauthorized() {
    let identity = Arc::new(NodeIdentity::generate("node-a").unwrap());
    let store = Arc::new(FakeStore::new());
    // Deliberately never populate the cert cache for "node-a".
    let ctx = build_ctx(store, identity.clone()).await;

    let action = sign_action(&identity, "action-3", "MERGE (n {id: 'x'})");
    let outcome = handle_publish(&ctx, action).await;
    match outcome {
        PublishOutcome::Rejected { status, .. } => assert_eq!(status, 401),
        other => panic!("expected a rejection, got a {} status", other.status()),
    }
}

#[tokio::test]
async fn tidy_cycle_prunes_peers_older_than_expiry() {
    let store: Arc<dyn PeerDirectory> = Arc::new(FakeStore::new());
    let now = Utc::now();

    let stale = PeerRecord {
        remote_addr: "127.0.0.1:1".to_string(),
        node_id: "stale-peer".to_string(),
        filter: BloomFilter::new().encode(),
        created_at: now - propolis::node::PEER_EXPIRY - chrono::Duration::minutes(1),
        updated_at: now - propolis::node::PEER_EXPIRY - chrono::Duration::minutes(1),
    };
    let fresh = PeerRecord {
        remote_addr: "127.0.0.1:2".to_string(),
        node_id: "fresh-peer".to_string(),
        filter: BloomFilter::new().encode(),
        created_at: now,
        updated_at: now,
    };
    store.upsert_peer(&stale).await.unwrap();
    store.upsert_peer(&fresh).await.unwrap();

    propolis::node::tidy_stale(&store).await;

    let remaining = store.list_peers().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].node_id, "fresh-peer");
}
