//! Certificate parsing and the at-most-one-in-flight-fetch cache described
//! in `spec.md` §5 ("a miss triggers at-most-one in-flight fetch per
//! identifier"): an `Arc<RwLock<Option<T>>>`-style discovery cache,
//! refreshed on miss, keyed per identifier instead of holding one shared slot.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use tokio::sync::{Mutex, Notify};

use crate::error::PropolisError;

/// Recovers the Ed25519 public key embedded in a self-signed certificate's
/// SubjectPublicKeyInfo. Ed25519 SPKI (RFC 8410) carries the raw 32-byte key
/// directly in the subjectPublicKey bit string, so no further decoding of
/// the algorithm-specific payload is needed once x509-parser has split out
/// the SPKI.
pub fn extract_verifying_key(der: &[u8]) -> anyhow::Result<VerifyingKey> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)?;
    let spki = cert.public_key();
    let raw = spki.subject_public_key.data.as_ref();
    let bytes: [u8; 32] = raw.try_into().map_err(|_| anyhow::anyhow!("unexpected SPKI length for Ed25519"))?;
    Ok(VerifyingKey::from_bytes(&bytes)?)
}

#[async_trait::async_trait]
pub trait CertStore: Send + Sync {
    async fn get_cert(&self, identifier: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put_cert(&self, identifier: &str, der: &[u8]) -> anyhow::Result<()>;
}

/// The network side of certificate resolution: fetching a peer's cert over
/// `GET /whois/{id}` when it isn't cached. Implemented by the transport
/// layer so this module stays transport-agnostic.
#[async_trait::async_trait]
pub trait CertSource: Send + Sync {
    async fn fetch_remote(&self, identifier: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct CertCache {
    store: Arc<dyn CertStore>,
    source: Arc<dyn CertSource>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl CertCache {
    pub fn new(store: Arc<dyn CertStore>, source: Arc<dyn CertSource>) -> Self {
        Self { store, source, inflight: Mutex::new(HashMap::new()) }
    }

    /// Resolves an identifier to its verifying key, fetching and caching the
    /// certificate on a miss. Concurrent callers for the same identifier
    /// share a single in-flight fetch.
    pub async fn resolve(&self, identifier: &str) -> Result<VerifyingKey, PropolisError> {
        loop {
            if let Some(der) = self
                .store
                .get_cert(identifier)
                .await
                .map_err(|e| PropolisError::Transient(e.to_string()))?
            {
                return extract_verifying_key(&der)
                    .map_err(|_| PropolisError::Unauthorized { identifier: identifier.to_string() });
            }

            let winner_notify = {
                let mut guard = self.inflight.lock().await;
                if let Some(existing) = guard.get(identifier) {
                    Some((false, existing.clone()))
                } else {
                    let notify = Arc::new(Notify::new());
                    guard.insert(identifier.to_string(), notify.clone());
                    Some((true, notify))
                }
            };

            let (is_winner, notify) = winner_notify.expect("always Some");
            if !is_winner {
                notify.notified().await;
                continue; // the winner populated (or failed to populate) the cache; re-check it
            }

            let fetch_result = self.source.fetch_remote(identifier).await;
            {
                let mut guard = self.inflight.lock().await;
                guard.remove(identifier);
            }
            notify.notify_waiters();

            let der = fetch_result.map_err(|_| PropolisError::Unauthorized { identifier: identifier.to_string() })?;
            self.store.put_cert(identifier, &der).await.ok();
            return extract_verifying_key(&der)
                .map_err(|_| PropolisError::Unauthorized { identifier: identifier.to_string() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemStore(Mutex<HashMap<String, Vec<u8>>>);

    #[async_trait::async_trait]
    impl CertStore for MemStore {
        async fn get_cert(&self, identifier: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.0.lock().await.get(identifier).cloned())
        }
        async fn put_cert(&self, identifier: &str, der: &[u8]) -> anyhow::Result<()> {
            self.0.lock().await.insert(identifier.to_string(), der.to_vec());
            Ok(())
        }
    }

    struct CountingSource {
        der: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CertSource for CountingSource {
        async fn fetch_remote(&self, _identifier: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(self.der.clone())
        }
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let identity = NodeIdentity::generate("node-a").unwrap();
        let store = Arc::new(MemStore(Mutex::new(HashMap::new())));
        let source = Arc::new(CountingSource { der: identity.cert_der.clone(), calls: AtomicUsize::new(0) });
        let cache = Arc::new(CertCache::new(store, source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.resolve("node-a").await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
