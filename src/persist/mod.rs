//! Persistence adapter (`spec.md` §4.7): schema provisioning plus CRUD over
//! `seeds`, `peers`, `local_subs`, `actions`, `certificate_cache`. Follows the
//! same pooled-connection, trait-per-concern shape as the graph repo, with a
//! repo trait scoped to the tables this system actually needs.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PropolisError;
use crate::model::{Action, PeerRecord, SeedRecord};

pub use postgres::PgPersistStore;

/// Dedup-checked action persistence: the barrier described in `spec.md` §4.4
/// step 4. `try_insert` returns `false` when the id was already present
/// (the 302-duplicate path), `true` when this call performed the insert.
#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn try_insert(&self, action: &Action) -> Result<bool, PropolisError>;
}

/// Peer/seed directory, shared by the seed's `/hello` handler, a peer's
/// heartbeat tick, and the propagation fabric's fan-out target list.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn upsert_peer(&self, record: &PeerRecord) -> anyhow::Result<()>;
    async fn upsert_seed(&self, record: &SeedRecord) -> anyhow::Result<()>;
    async fn list_peers(&self) -> anyhow::Result<Vec<PeerRecord>>;
    async fn list_seeds(&self) -> anyhow::Result<Vec<SeedRecord>>;
    async fn remove_peer(&self, node_id: &str) -> anyhow::Result<()>;
    /// Removes peers and seeds whose `updated_at` is older than `cutoff`,
    /// returning the number of rows removed. Drives the minute tidy cycle.
    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Records the `--sub` keys a node was configured with at some past startup
/// (`local_subs`). The interest filter itself is rebuilt fresh from the CLI
/// on every boot (`spec.md` §5: "writes only from the configuration layer at
/// startup"); this is a durable record of prior subscriptions, not something
/// the filter is read back from.
#[async_trait]
pub trait LocalSubscriptions: Send + Sync {
    async fn record_sub(&self, subscription_key: &str) -> anyhow::Result<()>;
    async fn list_subs(&self) -> anyhow::Result<Vec<String>>;
}
