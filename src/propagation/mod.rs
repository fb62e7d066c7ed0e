//! The propagation fabric (`spec.md` §4.4, §5, §7): verifies, persists, and
//! gossips signed actions. The synchronous half of `handle_publish` runs on
//! the request task; the asynchronous half (local execution, peer fan-out)
//! is spawned after the 202 response per §4.4 step 8 / §7's propagation
//! policy ("executor faults and dispatch faults happen asynchronously...
//! they do not affect the caller").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::bloom::BloomFilter;
use crate::error::PropolisError;
use crate::graph::GraphRepo;
use crate::identity::cert::CertCache;
use crate::identity::NodeIdentity;
use crate::model::{Action, Command};
use crate::lexer::lex;
use crate::observability::MetricsRegistry;
use crate::parser::parse;
use crate::persist::{ActionStore, PeerDirectory};
use crate::transport::{self, envelope::Request};

/// Per-hop deadline for an outbound dispatch (`spec.md` §5: "default 5 s per hop").
const HOP_DEADLINE: Duration = Duration::from_secs(5);

pub struct PublishContext {
    pub node_identity: Arc<NodeIdentity>,
    pub action_store: Arc<dyn ActionStore>,
    pub peer_directory: Arc<dyn PeerDirectory>,
    pub cert_cache: Arc<CertCache>,
    pub interest_filter: Arc<BloomFilter>,
    pub exec_tx: mpsc::UnboundedSender<(Action, Command)>,
    pub client_endpoint: quinn::Endpoint,
    pub metrics: Arc<MetricsRegistry>,
}

/// The synchronous outcome handed back to the caller of `/publish`, mapping
/// directly onto `spec.md` §4.4's response codes.
pub enum PublishOutcome {
    Accepted,
    Duplicate,
    Rejected { status: u16, message: String },
}

impl PublishOutcome {
    pub fn status(&self) -> u16 {
        match self {
            PublishOutcome::Accepted => 202,
            PublishOutcome::Duplicate => 302,
            PublishOutcome::Rejected { status, .. } => *status,
        }
    }
}

/// Runs `spec.md` §4.4 steps 1-7 synchronously, then spawns step 8.
pub async fn handle_publish(ctx: &Arc<PublishContext>, action: Action) -> PublishOutcome {
    // Step 3: verify the signature before the dedup/persist barrier.
    match ctx.cert_cache.resolve(&action.identity).await {
        Ok(key) => {
            let mut verifier = crate::identity::Verifier::new(key);
            verifier.update(&action.signed_digest());
            if let Err(e) = verifier.finalize(&action.encoded_signature) {
                ctx.metrics.verification_failures_total.inc();
                return PublishOutcome::Rejected { status: e.to_status_code(), message: e.to_string() };
            }
        }
        Err(e) => {
            ctx.metrics.verification_failures_total.inc();
            return PublishOutcome::Rejected { status: e.to_status_code(), message: e.to_string() };
        }
    }

    // Step 4: persist (the dedup barrier).
    let inserted = match ctx.action_store.try_insert(&action).await {
        Ok(inserted) => inserted,
        Err(e) => return PublishOutcome::Rejected { status: e.to_status_code(), message: e.to_string() },
    };
    if !inserted {
        ctx.metrics.actions_duplicate_total.inc();
        return PublishOutcome::Duplicate;
    }
    ctx.metrics.actions_received_total.inc();

    // Step 5: parse.
    let tokens = lex(&action.action);
    let command = match parse(&tokens) {
        Ok(cmd) => cmd,
        Err(e) => {
            ctx.metrics.syntax_errors_total.inc();
            return PublishOutcome::Rejected { status: e.to_status_code(), message: e.to_string() };
        }
    };

    // Step 6: moderation gate (406 path). No policy is defined yet, so this
    // always accepts; the hook exists so a real policy can be dropped in
    // without touching the rest of the handler.
    if let Err(e) = moderate(&action) {
        return PublishOutcome::Rejected { status: e.to_status_code(), message: e.to_string() };
    }

    // Step 7: enumerate identifiers.
    let identifiers = command_identifiers(&command);

    // Step 8 happens by returning; step 9 is spawned by the caller (the
    // node-server request handler) once it has sent the 202/302 response, or
    // here directly — spawning has no externally observable ordering effect
    // since it never touches the response the caller already holds.
    let ctx = ctx.clone();
    tokio::spawn(async move {
        propagate(&ctx, action, command, identifiers).await;
    });

    PublishOutcome::Accepted
}

/// Application-level moderation gate (`spec.md` §9: "a placeholder; its
/// rejection criteria are undefined"). Always accepts today.
fn moderate(_action: &Action) -> Result<(), PropolisError> {
    Ok(())
}

fn command_identifiers(command: &Command) -> Vec<String> {
    match command {
        Command::Merge(e) | Command::Delete(e) | Command::Subscribe(e) => e.identifiers(),
        Command::Match { entity, .. } => entity.identifiers(),
    }
}

/// Step 8: local enqueue (if interesting) and peer fan-out, run concurrently.
async fn propagate(ctx: &Arc<PublishContext>, action: Action, command: Command, identifiers: Vec<String>) {
    let refs: Vec<&str> = identifiers.iter().map(String::as_str).collect();
    let locally_interesting = ctx.interest_filter.test_any(refs.iter().copied());

    let local = async {
        if locally_interesting {
            let _ = ctx.exec_tx.send((action.clone(), command));
        }
    };

    let dispatch = dispatch_to_peers(ctx, &action, &refs);
    tokio::join!(local, dispatch);
}

async fn dispatch_to_peers(ctx: &Arc<PublishContext>, action: &Action, identifiers: &[&str]) {
    let peers = match ctx.peer_directory.list_peers().await {
        Ok(p) => p,
        Err(_) => return,
    };

    let signed_segment = {
        let mut signer = ctx.node_identity.signer();
        signer.update(action.action.as_bytes());
        signer.finalize()
    };
    let forwarded = action.clone().with_forwarded_segment(&ctx.node_identity.node_id, &signed_segment);

    let mut targets = Vec::new();
    for peer in peers {
        if forwarded.chain_contains(&peer.node_id) {
            continue;
        }
        let Ok(filter) = BloomFilter::decode(&peer.filter) else { continue };
        if !filter.test_any(identifiers.iter().copied()) {
            continue;
        }
        targets.push(peer);
    }

    let dispatches = targets.into_iter().map(|peer| {
        let ctx = ctx.clone();
        let forwarded = forwarded.clone();
        async move {
            let Ok(addr) = peer.remote_addr.parse::<SocketAddr>() else { return };
            let req = build_publish_request(&forwarded);
            ctx.metrics.dispatch_attempts_total.inc();
            let outcome = tokio::time::timeout(HOP_DEADLINE, transport::send_request(&ctx.client_endpoint, addr, req)).await;
            if !matches!(outcome, Ok(Ok(_))) {
                ctx.metrics.dispatch_failures_total.inc();
            }
        }
    });
    futures_util::future::join_all(dispatches).await;
}

fn build_publish_request(action: &Action) -> Request {
    let mut req = Request::new("POST /publish").with_body(action.action.clone().into_bytes());
    req.remote_addr = Some(action.remote_addr.clone());
    req.action_id = Some(action.id.clone());
    req.node_id = Some(action.node_id.clone());
    req.identifier = Some(action.identity.clone());
    req.signature = Some(action.encoded_signature.clone());
    if !action.received_from.is_empty() {
        req.received_from = Some(action.received_from.join(";"));
    }
    req
}

/// Spawns the cache's single-writer executor loop (`spec.md` §5: "pulls
/// `Action` values from an unbounded queue and executes them serially").
/// `dispatch_tx` is the secondary results queue observers may consume.
pub fn spawn_cache_loop(
    repo: Arc<dyn GraphRepo>,
    metrics: Arc<MetricsRegistry>,
    dispatch_tx: mpsc::Sender<(Action, Result<crate::model::ExecResult, PropolisError>)>,
) -> mpsc::UnboundedSender<(Action, Command)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Action, Command)>();
    tokio::spawn(async move {
        while let Some((action, command)) = rx.recv().await {
            let started = std::time::Instant::now();
            let result = repo.execute(command).await;
            metrics.executor_duration_seconds.observe(started.elapsed().as_secs_f64());
            if result.is_err() {
                metrics.executor_errors_total.inc();
            }
            let _ = dispatch_tx.try_send((action, result));
        }
    });
    tx
}

/// Builds the in-memory `Action` record for a freshly received `/publish`
/// request (`spec.md` §4.4 step 1).
pub fn build_action(
    action_id: String,
    identity: String,
    remote_addr: String,
    node_id: String,
    statement: String,
    signature: String,
    received_from: Option<String>,
) -> Action {
    Action {
        id: action_id,
        timestamp: Utc::now(),
        identity,
        remote_addr,
        node_id,
        action: statement,
        encoded_signature: signature,
        received_from: received_from
            .map(|s| s.split(';').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default(),
    }
}
