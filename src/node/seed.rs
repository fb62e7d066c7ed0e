//! Seed role (`spec.md` §4.4): bootstrap and peer-directory. Endpoints
//! `POST /hello`, `POST /goodbye`, `GET /whois/{id}`, `GET /whoami`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::bloom::BloomFilter;
use crate::identity::cert::CertStore;
use crate::identity::NodeIdentity;
use crate::model::PeerRecord;
use crate::persist::PeerDirectory;
use crate::transport::envelope::{Request, Response};

use super::{sample_peers, tidy_stale, whois, JoinResponse, PeerSpec, RequestRouter, SeedSpec, TICK_INTERVAL};

pub struct SeedRouter {
    pub node_identity: Arc<NodeIdentity>,
    pub peer_directory: Arc<dyn PeerDirectory>,
    pub cert_store: Arc<dyn CertStore>,
    pub started_at: chrono::DateTime<Utc>,
    /// This seed's own listening address, advertised in `/hello`'s seed list
    /// and `/whoami` — distinct from any caller's observed `remote_addr`.
    pub bind_addr: SocketAddr,
}

#[async_trait]
impl RequestRouter for SeedRouter {
    async fn route(&self, req: Request) -> Response {
        match req.path.as_str() {
            "POST /hello" => self.hello(req).await,
            "POST /goodbye" => self.goodbye(req).await,
            "GET /whoami" => self.whoami().await,
            path if path.starts_with("GET /whois/") => {
                whois(&self.cert_store, &path["GET /whois/".len()..]).await
            }
            _ => Response::text(404, "no such endpoint"),
        }
    }
}

impl SeedRouter {
    async fn hello(&self, req: Request) -> Response {
        let Some(node_id) = req.node_id.clone() else {
            return Response::text(400, "missing X-Node-ID");
        };
        let filter = String::from_utf8(req.body.clone()).unwrap_or_default();
        if BloomFilter::decode(&filter).is_err() {
            return Response::text(400, "malformed interest filter");
        }
        let now = Utc::now();
        let record = PeerRecord {
            remote_addr: req.remote_addr.clone().unwrap_or_default(),
            node_id: node_id.clone(),
            filter,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.peer_directory.upsert_peer(&record).await {
            return Response::text(503, e.to_string());
        }

        let peers = self.peer_directory.list_peers().await.unwrap_or_default();
        let peers = sample_peers(peers, &node_id)
            .into_iter()
            .map(|p| PeerSpec { remote_addr: p.remote_addr, node_id: p.node_id, created_at: p.created_at })
            .collect();

        let mut seeds: Vec<SeedSpec> = self
            .peer_directory
            .list_seeds()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|s| SeedSpec { remote_addr: s.remote_addr, node_id: s.node_id })
            .collect();
        seeds.push(SeedSpec { remote_addr: self.bind_addr.to_string(), node_id: self.node_identity.node_id.clone() });

        match Response::json(200, &JoinResponse { seeds, peers }) {
            Ok(r) => r,
            Err(e) => Response::text(500, e.to_string()),
        }
    }

    async fn goodbye(&self, req: Request) -> Response {
        let Some(node_id) = req.node_id else {
            return Response::text(400, "missing X-Node-ID");
        };
        match self.peer_directory.remove_peer(&node_id).await {
            Ok(()) => Response::text(200, "ok"),
            Err(e) => Response::text(503, e.to_string()),
        }
    }

    async fn whoami(&self) -> Response {
        let spec = PeerSpec {
            remote_addr: self.bind_addr.to_string(),
            node_id: self.node_identity.node_id.clone(),
            created_at: self.started_at,
        };
        Response::json(200, &spec).unwrap_or_else(|e| Response::text(500, e.to_string()))
    }
}

/// Seed loop (`spec.md` §5): accept inbound requests (driven by
/// `node::serve` separately) plus a minute tick that prunes stale peers.
pub async fn run_tidy_tick(peer_directory: Arc<dyn PeerDirectory>) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        tick.tick().await;
        tidy_stale(&peer_directory).await;
    }
}
