//! Per-role node server (`spec.md` §4.4, §5): endpoint routing shared across
//! Seed, Peer, and Cache, plus each role's minute tick. The accept-loop and
//! tick-loop run side by side per role, carrying the join/heartbeat/publish
//! protocol this system actually speaks rather than a push/pull replication
//! protocol.

pub mod cache;
pub mod peer;
pub mod seed;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::cert::{CertSource, CertStore};
use crate::persist::PeerDirectory;
use crate::propagation::PublishContext;
use crate::transport::envelope::{self, Request, Response};

/// Peers are aged out after this much inactivity (`spec.md` §3, resolving
/// the 3-vs-5-minute inconsistency noted in §9 in favor of 3 minutes).
pub use crate::model::PEER_EXPIRY;

pub const MAX_PEERS: usize = 5;
/// Minute tick driving heartbeats, re-join, and the seed's tidy cycle (`spec.md` §5).
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);
/// Grace period for draining in-flight requests on shutdown (`spec.md` §5).
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSpec {
    pub remote_addr: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSpec {
    pub remote_addr: String,
    pub node_id: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub seeds: Vec<SeedSpec>,
    pub peers: Vec<PeerSpec>,
}

#[async_trait]
pub trait RequestRouter: Send + Sync {
    async fn route(&self, req: Request) -> Response;
}

/// Accepts connections on `endpoint` and dispatches each request stream to
/// `router`. One task per connection, one task per bidirectional stream, a
/// worker-per-request shape matching "goroutine-per-peer dispatch" (`spec.md`
/// §9) generalized to "task-per-stream".
pub async fn serve(endpoint: quinn::Endpoint, router: Arc<dyn RequestRouter>) {
    while let Some(connecting) = endpoint.accept().await {
        let router = router.clone();
        tokio::spawn(async move {
            let connection = match connecting.await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "QUIC handshake failed");
                    return;
                }
            };
            let remote_addr = connection.remote_address().to_string();
            loop {
                let (send, recv) = match connection.accept_bi().await {
                    Ok(streams) => streams,
                    Err(_) => break,
                };
                let router = router.clone();
                let remote_addr = remote_addr.clone();
                tokio::spawn(async move { handle_stream(router, remote_addr, send, recv).await });
            }
        });
    }
}

async fn handle_stream(
    router: Arc<dyn RequestRouter>,
    observed_remote_addr: String,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) {
    let mut req: Request = match envelope::read_frame(&mut recv).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to decode request frame");
            return;
        }
    };
    req.remote_addr = Some(observed_remote_addr);
    let resp = router.route(req).await;
    if let Err(e) = envelope::write_frame(&mut send, &resp).await {
        warn!(error = %e, "failed to write response frame");
    }
    let _ = send.finish();
}

/// Shared handling for `GET /whois/{id}`, common to every role.
pub async fn whois(cert_store: &Arc<dyn CertStore>, identifier: &str) -> Response {
    match cert_store.get_cert(identifier).await {
        Ok(Some(der)) => {
            let pem = pem_encode(&der);
            Response::text(200, pem)
        }
        Ok(None) => Response::text(404, "unknown identity"),
        Err(e) => Response::text(503, e.to_string()),
    }
}

/// Resolves an unseen identifier's certificate by asking every known peer
/// and seed `GET /whois/{id}`, first answer wins. Backs the [`CertCache`]'s
/// miss path; the directory is read fresh on every call since it changes
/// independently of the cache.
pub struct RemoteCertSource {
    pub peer_directory: Arc<dyn PeerDirectory>,
    pub client_endpoint: quinn::Endpoint,
}

#[async_trait]
impl CertSource for RemoteCertSource {
    async fn fetch_remote(&self, identifier: &str) -> anyhow::Result<Vec<u8>> {
        let mut addrs: Vec<String> = self
            .peer_directory
            .list_peers()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.remote_addr)
            .collect();
        addrs.extend(self.peer_directory.list_seeds().await.unwrap_or_default().into_iter().map(|s| s.remote_addr));

        for addr in addrs {
            let Ok(socket_addr) = addr.parse() else { continue };
            let req = Request::new(format!("GET /whois/{identifier}"));
            let resp = match crate::transport::send_request(&self.client_endpoint, socket_addr, req).await {
                Ok(r) if r.status == 200 => r,
                _ => continue,
            };
            if let Some(der) = pem_decode(&resp.body) {
                return Ok(der);
            }
        }
        anyhow::bail!("no peer answered whois for {identifier}")
    }
}

fn pem_decode(body: &[u8]) -> Option<Vec<u8>> {
    use base64::Engine;
    let text = std::str::from_utf8(body).ok()?;
    let b64: String = text
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect();
    base64::engine::general_purpose::STANDARD.decode(b64).ok()
}

fn pem_encode(der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

/// Shared handling for `POST /publish` and the legacy `POST /action` alias.
pub async fn publish(ctx: &Arc<PublishContext>, req: Request) -> Response {
    let Some(action_id) = req.action_id.clone() else {
        return Response::text(400, "missing X-Propolis-Action-ID");
    };
    let Some(node_id) = req.node_id.clone() else {
        return Response::text(400, "missing X-Propolis-Node-ID");
    };
    let Some(identity) = req.identifier.clone() else {
        return Response::text(400, "missing X-Propolis-Identifier");
    };
    let Some(signature) = req.signature.clone() else {
        return Response::text(400, "missing X-Propolis-Signature");
    };
    if req.body.len() > 1024 * 1024 {
        return Response::text(400, "statement exceeds 1 MiB");
    }
    let Ok(statement) = String::from_utf8(req.body.clone()) else {
        return Response::text(400, "statement is not valid UTF-8");
    };

    let action = crate::propagation::build_action(
        action_id,
        identity,
        req.remote_addr.clone().unwrap_or_default(),
        node_id,
        statement,
        signature,
        req.received_from.clone(),
    );

    match crate::propagation::handle_publish(ctx, action).await {
        crate::propagation::PublishOutcome::Accepted => Response::text(202, "accepted"),
        crate::propagation::PublishOutcome::Duplicate => Response::text(302, "duplicate"),
        crate::propagation::PublishOutcome::Rejected { status, message } => Response::text(status, message),
    }
}

/// Picks up to `MAX_PEERS` peers at random, excluding `exclude_node_id`.
pub fn sample_peers(mut peers: Vec<crate::model::PeerRecord>, exclude_node_id: &str) -> Vec<crate::model::PeerRecord> {
    use rand::seq::SliceRandom;
    peers.retain(|p| p.node_id != exclude_node_id);
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(MAX_PEERS);
    peers
}

/// Runs the minute tidy cycle shared by seeds (and, harmlessly, peers): peers
/// and seeds whose `updated_at` is older than `PEER_EXPIRY` are removed.
pub async fn tidy_stale(peer_directory: &Arc<dyn PeerDirectory>) {
    let cutoff = Utc::now() - PEER_EXPIRY;
    if let Err(e) = peer_directory.prune_stale(cutoff).await {
        warn!(error = %e, "tidy cycle failed");
    }
}
