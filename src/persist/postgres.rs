//! `sqlx::PgPool`-backed implementation of [`super::ActionStore`],
//! [`super::PeerDirectory`], and [`crate::identity::cert::CertStore`], plus
//! idempotent schema provisioning. Parameterized SQL throughout, enumerating
//! columns explicitly rather than relying on an ORM's reflection (per
//! `spec.md` §9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::PropolisError;
use crate::identity::cert::CertStore;
use crate::model::{Action, PeerRecord, SeedRecord};

use super::{ActionStore, LocalSubscriptions, PeerDirectory};

pub struct PgPersistStore {
    pool: PgPool,
}

impl PgPersistStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the up-migration script. Safe to call on every startup: every
    /// statement is `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`.
    pub async fn provision_schema(&self) -> anyhow::Result<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = include_str!("../../schema.sql");

#[async_trait]
impl ActionStore for PgPersistStore {
    async fn try_insert(&self, action: &Action) -> Result<bool, PropolisError> {
        let result = sqlx::query(
            "INSERT INTO actions (id, timestamp, identity, remote_addr, node_id, action, encoded_signature, received_from)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&action.id)
        .bind(action.timestamp)
        .bind(&action.identity)
        .bind(&action.remote_addr)
        .bind(&action.node_id)
        .bind(&action.action)
        .bind(&action.encoded_signature)
        .bind(serde_json::to_value(&action.received_from).unwrap_or_default())
        .execute(&self.pool)
        .await
        .map_err(|e| PropolisError::Transient(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PeerDirectory for PgPersistStore {
    async fn upsert_peer(&self, record: &PeerRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO peers (remote_addr, node_id, filter, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (node_id) DO UPDATE SET remote_addr = $1, filter = $3, updated_at = $5",
        )
        .bind(&record.remote_addr)
        .bind(&record.node_id)
        .bind(&record.filter)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_seed(&self, record: &SeedRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO seeds (remote_addr, node_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (node_id) DO UPDATE SET remote_addr = $1, updated_at = $4",
        )
        .bind(&record.remote_addr)
        .bind(&record.node_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<PeerRecord>> {
        let rows: Vec<(String, String, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT remote_addr, node_id, filter, created_at, updated_at FROM peers",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(remote_addr, node_id, filter, created_at, updated_at)| PeerRecord {
                remote_addr,
                node_id,
                filter,
                created_at,
                updated_at,
            })
            .collect())
    }

    async fn list_seeds(&self) -> anyhow::Result<Vec<SeedRecord>> {
        let rows: Vec<(String, String, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as("SELECT remote_addr, node_id, created_at, updated_at FROM seeds")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(remote_addr, node_id, created_at, updated_at)| SeedRecord {
                remote_addr,
                node_id,
                created_at,
                updated_at,
            })
            .collect())
    }

    async fn remove_peer(&self, node_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM peers WHERE node_id = $1").bind(node_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let peers = sqlx::query("DELETE FROM peers WHERE updated_at < $1").bind(cutoff).execute(&self.pool).await?;
        let seeds = sqlx::query("DELETE FROM seeds WHERE updated_at < $1").bind(cutoff).execute(&self.pool).await?;
        Ok(peers.rows_affected() + seeds.rows_affected())
    }
}

#[async_trait]
impl LocalSubscriptions for PgPersistStore {
    async fn record_sub(&self, subscription_key: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO local_subs (subscription_key, created_at) VALUES ($1, $2)
             ON CONFLICT (subscription_key) DO NOTHING",
        )
        .bind(subscription_key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_subs(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT subscription_key FROM local_subs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[async_trait]
impl CertStore for PgPersistStore {
    async fn get_cert(&self, identifier: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT der FROM certificate_cache WHERE identifier = $1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(der,)| der))
    }

    async fn put_cert(&self, identifier: &str, der: &[u8]) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO certificate_cache (identifier, der, created_at, updated_at)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (identifier) DO UPDATE SET der = $2, updated_at = $3",
        )
        .bind(identifier)
        .bind(der)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
