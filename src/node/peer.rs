//! Peer role (`spec.md` §4.4): ingress/egress for signed actions plus
//! gossip. Endpoints `POST /ping`, `POST /pong`, `GET /whois/{id}`,
//! `POST /publish`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::bloom::BloomFilter;
use crate::identity::cert::CertStore;
use crate::identity::NodeIdentity;
use crate::model::{PeerRecord, SeedRecord};
use crate::persist::PeerDirectory;
use crate::propagation::PublishContext;
use crate::transport::{self, envelope::{Request, Response}};

use super::{publish, whois, JoinResponse, RequestRouter, TICK_INTERVAL};

pub struct PeerRouter {
    pub node_identity: Arc<NodeIdentity>,
    pub peer_directory: Arc<dyn PeerDirectory>,
    pub cert_store: Arc<dyn CertStore>,
    pub publish_ctx: Arc<PublishContext>,
}

#[async_trait]
impl RequestRouter for PeerRouter {
    async fn route(&self, req: Request) -> Response {
        match req.path.as_str() {
            "POST /ping" => self.ping(req).await,
            "POST /pong" => self.pong(req).await,
            "POST /publish" => publish(&self.publish_ctx, req).await,
            path if path.starts_with("GET /whois/") => {
                whois(&self.cert_store, &path["GET /whois/".len()..]).await
            }
            _ => Response::text(404, "no such endpoint"),
        }
    }
}

impl PeerRouter {
    async fn ping(&self, req: Request) -> Response {
        let Some(node_id) = req.node_id.clone() else {
            return Response::text(400, "missing X-Node-ID");
        };
        let filter = String::from_utf8(req.body.clone()).unwrap_or_default();
        if BloomFilter::decode(&filter).is_err() {
            return Response::text(400, "malformed interest filter");
        }
        let remote_addr = req.remote_addr.clone().unwrap_or_default();
        let now = Utc::now();
        if let Err(e) = self
            .peer_directory
            .upsert_peer(&PeerRecord {
                remote_addr: remote_addr.clone(),
                node_id: node_id.clone(),
                filter,
                created_at: now,
                updated_at: now,
            })
            .await
        {
            return Response::text(503, e.to_string());
        }

        // "the remote updates updated_at and filter, then asynchronously
        // sends /pong" (spec.md §4.4) — the pong itself carries no payload
        // and its delivery does not gate this response.
        let endpoint = self.publish_ctx.client_endpoint.clone();
        tokio::spawn(async move {
            if let Ok(addr) = remote_addr.parse::<SocketAddr>() {
                let _ = transport::send_request(&endpoint, addr, Request::new("POST /pong")).await;
            }
        });

        Response::text(200, "ok")
    }

    async fn pong(&self, req: Request) -> Response {
        let Some(node_id) = req.node_id else {
            return Response::text(400, "missing X-Node-ID");
        };
        let now = Utc::now();
        let existing = self.peer_directory.list_peers().await.unwrap_or_default();
        if let Some(mut peer) = existing.into_iter().find(|p| p.node_id == node_id) {
            peer.updated_at = now;
            if let Err(e) = self.peer_directory.upsert_peer(&peer).await {
                return Response::text(503, e.to_string());
            }
        }
        Response::text(200, "ok")
    }
}

/// Peer loop (`spec.md` §5): minute tick re-joins seeds and pings known
/// peers; shutdown sends `/goodbye` to every known seed.
pub async fn run_heartbeat_tick(
    node_identity: Arc<NodeIdentity>,
    peer_directory: Arc<dyn PeerDirectory>,
    client_endpoint: quinn::Endpoint,
    interest_filter: Arc<BloomFilter>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        tick.tick().await;
        rejoin_seeds(&node_identity, &peer_directory, &client_endpoint, &interest_filter).await;
        ping_known_peers(&node_identity, &peer_directory, &client_endpoint, &interest_filter).await;
    }
}

async fn rejoin_seeds(
    node_identity: &Arc<NodeIdentity>,
    peer_directory: &Arc<dyn PeerDirectory>,
    client_endpoint: &quinn::Endpoint,
    interest_filter: &Arc<BloomFilter>,
) {
    let seeds = peer_directory.list_seeds().await.unwrap_or_default();
    for seed in seeds {
        let Ok(addr) = seed.remote_addr.parse::<SocketAddr>() else { continue };
        let mut req = Request::new("POST /hello").with_body(interest_filter.encode().into_bytes());
        req.node_id = Some(node_identity.node_id.clone());
        let resp = match tokio::time::timeout(super::SHUTDOWN_GRACE, transport::send_request(client_endpoint, addr, req)).await {
            Ok(Ok(r)) => r,
            _ => {
                warn!(seed = %seed.node_id, "seed unreachable during rejoin");
                continue;
            }
        };
        let Ok(join) = serde_json::from_slice::<JoinResponse>(&resp.body) else { continue };
        let now = Utc::now();
        for s in join.seeds {
            let _ = peer_directory
                .upsert_seed(&SeedRecord { remote_addr: s.remote_addr, node_id: s.node_id, created_at: now, updated_at: now })
                .await;
        }
        for p in join.peers {
            let _ = peer_directory
                .upsert_peer(&PeerRecord {
                    remote_addr: p.remote_addr,
                    node_id: p.node_id,
                    filter: BloomFilter::new().encode(),
                    created_at: p.created_at,
                    updated_at: now,
                })
                .await;
        }
    }
}

async fn ping_known_peers(
    node_identity: &Arc<NodeIdentity>,
    peer_directory: &Arc<dyn PeerDirectory>,
    client_endpoint: &quinn::Endpoint,
    interest_filter: &Arc<BloomFilter>,
) {
    let peers = peer_directory.list_peers().await.unwrap_or_default();
    for peer in peers {
        let Ok(addr) = peer.remote_addr.parse::<SocketAddr>() else { continue };
        let mut req = Request::new("POST /ping").with_body(interest_filter.encode().into_bytes());
        req.node_id = Some(node_identity.node_id.clone());
        // "A peer that fails ping is deleted locally" (spec.md §4.4).
        match tokio::time::timeout(super::TICK_INTERVAL / 2, transport::send_request(client_endpoint, addr, req)).await {
            Ok(Ok(_)) => {}
            _ => {
                let _ = peer_directory.remove_peer(&peer.node_id).await;
            }
        }
    }
}

/// Sends `/goodbye` to every known seed; called on shutdown.
pub async fn goodbye_to_seeds(node_identity: &NodeIdentity, peer_directory: &Arc<dyn PeerDirectory>, client_endpoint: &quinn::Endpoint) {
    let seeds = peer_directory.list_seeds().await.unwrap_or_default();
    for seed in seeds {
        let Ok(addr) = seed.remote_addr.parse::<SocketAddr>() else { continue };
        let mut req = Request::new("POST /goodbye");
        req.node_id = Some(node_identity.node_id.clone());
        let _ = tokio::time::timeout(super::SHUTDOWN_GRACE, transport::send_request(client_endpoint, addr, req)).await;
    }
}
