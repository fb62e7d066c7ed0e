//! Cache role (`spec.md` §4.4): the graph-owning evaluator. `POST /action`
//! is the legacy path; `POST /publish` is canonical. Both drive the same
//! verify/dedup/persist/parse/enqueue pipeline as the peer role — a cache
//! differs only in that it is expected to actually materialise what it
//! executes, not merely relay it.
//!
//! `GET /health` and `GET /metrics` are ambient additions (not part of
//! `spec.md` §4.4's endpoint table) attached to this role only, since it's
//! the one role that owns a graph store worth probing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::graph::GraphRepo;
use crate::observability::MetricsRegistry;
use crate::propagation::PublishContext;
use crate::transport::envelope::{Request, Response};

use super::{publish, RequestRouter};

pub struct CacheRouter {
    pub publish_ctx: Arc<PublishContext>,
    pub graph_repo: Arc<dyn GraphRepo>,
    pub metrics: Arc<MetricsRegistry>,
}

#[async_trait]
impl RequestRouter for CacheRouter {
    async fn route(&self, req: Request) -> Response {
        match req.path.as_str() {
            "POST /publish" | "POST /action" => publish(&self.publish_ctx, req).await,
            "GET /health" => crate::health::check(self.graph_repo.as_ref()).await,
            "GET /metrics" => Response::text(200, self.metrics.encode()),
            _ => Response::text(404, "no such endpoint"),
        }
    }
}
