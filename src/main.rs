use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use propolis::config::NodeRole;
use propolis::graph::{GraphRepo, MemoryGraphRepo, PgGraphRepo};
use propolis::identity::cert::CertCache;
use propolis::identity::NodeIdentity;
use propolis::node::{self, cache::CacheRouter, peer::PeerRouter, seed::SeedRouter, RequestRouter};
use propolis::observability;
use propolis::persist::{LocalSubscriptions, PgPersistStore};
use propolis::propagation::{spawn_cache_loop, PublishContext};
use propolis::bloom::BloomFilter;

#[derive(Parser)]
#[command(name = "propolis", about = "A federated peer-to-peer graph-mutation overlay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct NodeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value_t = 4433)]
    port: u16,
    /// Node-state database (seeds/peers/actions/certificate_cache).
    #[arg(long = "ndb")]
    node_db: Option<String>,
    /// Graph database (nodes/relations). Defaults to the node-state database.
    /// Pass the literal value `memory` to use a non-persistent in-process
    /// graph store instead (development/testing only).
    #[arg(long = "gdb")]
    graph_db: Option<String>,
    /// Bootstrap seed address, `host:port`. May be repeated.
    #[arg(long = "seed")]
    seeds: Vec<String>,
    /// Subscription key folded into the startup interest filter. May be repeated.
    #[arg(long = "sub")]
    subs: Vec<String>,
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a Seed node: bootstrap and peer-directory only.
    Seed(NodeArgs),
    /// Run as a Peer node: ingress/egress plus gossip.
    Peer(NodeArgs),
    /// Run as a Cache node: executes and persists the graph.
    Cache(NodeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (role, args) = match &cli.command {
        Commands::Seed(a) => (NodeRole::Seed, a.clone()),
        Commands::Peer(a) => (NodeRole::Peer, a.clone()),
        Commands::Cache(a) => (NodeRole::Cache, a.clone()),
    };

    // rustls 0.23 requires a process-level default crypto provider before any
    // `ClientConfig`/`ServerConfig` builder runs; this crate only ever links
    // in `ring`, so installing it unconditionally is safe.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let obs = observability::init_observability().await?;

    let mut settings = propolis::config::load(args.config.as_deref()).unwrap_or_default();
    settings.role = role;
    settings.host = args.host;
    settings.port = args.port;
    if let Some(ndb) = args.node_db {
        settings.node_db_url = ndb;
    }
    let use_memory_graph = args.graph_db.as_deref() == Some("memory");
    match args.graph_db {
        Some(gdb) if gdb != "memory" => settings.graph_db_url = gdb,
        Some(_) => {}
        None => settings.graph_db_url = settings.node_db_url.clone(),
    }
    if !args.seeds.is_empty() {
        settings.seeds = args.seeds;
    }
    if !args.subs.is_empty() {
        settings.subs = args.subs;
    }

    tracing::info!(role = ?settings.role, host = %settings.host, port = settings.port, "starting propolis node");

    let node_pool = sqlx::PgPool::connect(&settings.node_db_url).await?;
    let persist_store = Arc::new(PgPersistStore::new(node_pool));
    persist_store.provision_schema().await?;

    let graph_repo: Arc<dyn GraphRepo> = if use_memory_graph {
        Arc::new(MemoryGraphRepo::new())
    } else {
        let graph_pool = sqlx::PgPool::connect(&settings.graph_db_url).await?;
        Arc::new(PgGraphRepo::new(graph_pool, settings.exec_timeout_ms))
    };

    let node_identity = Arc::new(NodeIdentity::generate(format!("node-{}", uuid_like()))?);

    let mut interest_filter = BloomFilter::new();
    for sub in &settings.subs {
        interest_filter.set(sub);
        persist_store.record_sub(sub).await?;
    }
    let interest_filter = Arc::new(interest_filter);

    let bind_addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let server_endpoint = propolis::transport::server_endpoint(
        bind_addr,
        node_identity.cert_der.clone(),
        node_identity.signing_key.to_bytes().to_vec(),
    )?;
    let client_endpoint = propolis::transport::client_endpoint()?;

    let cert_source = Arc::new(node::RemoteCertSource {
        peer_directory: persist_store.clone(),
        client_endpoint: client_endpoint.clone(),
    });
    let cert_cache = Arc::new(CertCache::new(persist_store.clone(), cert_source));

    let (dispatch_tx, mut dispatch_rx) = mpsc::channel(1024);
    let exec_sender = spawn_cache_loop(graph_repo.clone(), obs.metrics.clone(), dispatch_tx);
    // The observer queue has no consumer yet (`spec.md` names no subscriber
    // fan-out beyond the executor); drain it so the bounded channel never
    // backs up the executor loop.
    tokio::spawn(async move { while dispatch_rx.recv().await.is_some() {} });

    let publish_ctx = Arc::new(PublishContext {
        node_identity: node_identity.clone(),
        action_store: persist_store.clone(),
        peer_directory: persist_store.clone(),
        cert_cache: cert_cache.clone(),
        interest_filter: interest_filter.clone(),
        exec_tx: exec_sender,
        client_endpoint: client_endpoint.clone(),
        metrics: obs.metrics.clone(),
    });

    let router: Arc<dyn RequestRouter> = match settings.role {
        NodeRole::Seed => Arc::new(SeedRouter {
            node_identity: node_identity.clone(),
            peer_directory: persist_store.clone(),
            cert_store: persist_store.clone(),
            started_at: chrono::Utc::now(),
            bind_addr,
        }),
        NodeRole::Peer => Arc::new(PeerRouter {
            node_identity: node_identity.clone(),
            peer_directory: persist_store.clone(),
            cert_store: persist_store.clone(),
            publish_ctx: publish_ctx.clone(),
        }),
        NodeRole::Cache => Arc::new(CacheRouter {
            publish_ctx: publish_ctx.clone(),
            graph_repo: graph_repo.clone(),
            metrics: obs.metrics.clone(),
        }),
    };

    let serve_task = tokio::spawn(node::serve(server_endpoint, router));

    let tick_task = match settings.role {
        NodeRole::Seed => {
            let peer_directory = persist_store.clone() as Arc<dyn propolis::persist::PeerDirectory>;
            Some(tokio::spawn(node::seed::run_tidy_tick(peer_directory)))
        }
        NodeRole::Peer => {
            let peer_directory = persist_store.clone() as Arc<dyn propolis::persist::PeerDirectory>;
            Some(tokio::spawn(node::peer::run_heartbeat_tick(
                node_identity.clone(),
                peer_directory,
                client_endpoint.clone(),
                interest_filter.clone(),
            )))
        }
        NodeRole::Cache => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");

    if matches!(settings.role, NodeRole::Peer) {
        let peer_directory = persist_store.clone() as Arc<dyn propolis::persist::PeerDirectory>;
        node::peer::goodbye_to_seeds(node_identity.as_ref(), &peer_directory, &client_endpoint).await;
    }

    serve_task.abort();
    if let Some(t) = tick_task {
        t.abort();
    }
    tokio::time::sleep(node::SHUTDOWN_GRACE).await;

    Ok(())
}

fn uuid_like() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..12).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect()
}
