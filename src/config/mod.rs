use anyhow::Result;
use serde::Deserialize;

/// The three roles a node can run as (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Seed,
    Peer,
    Cache,
}

/// Runtime configuration for a Propolis node.
///
/// Values are loaded from (in order): an optional `config` file and
/// environment variables prefixed with `PLS_` (e.g. `PLS_PORT`), matching
/// the CLI surface of `spec.md` §6: `--host`, `--port`, `--ndb`, `--gdb`,
/// repeated `--seed`, repeated `--sub`, `--config`.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    /// Node-state store (seeds/peers/actions/certificate_cache).
    pub node_db_url: String,
    /// Graph store (nodes/relations and their labels/attributes). May point
    /// at the same database as `node_db_url`.
    pub graph_db_url: String,
    /// Bootstrap seed addresses, `host:port`.
    pub seeds: Vec<String>,
    /// Subscription keys folded into the node's interest filter at startup.
    pub subs: Vec<String>,
    pub log_level: Option<String>,
    /// `SET LOCAL statement_timeout` applied per graph-executor transaction.
    pub exec_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: NodeRole::Peer,
            host: "0.0.0.0".to_string(),
            port: 4433,
            node_db_url: "postgres://localhost/propolis".to_string(),
            graph_db_url: "postgres://localhost/propolis".to_string(),
            seeds: Vec::new(),
            subs: Vec::new(),
            log_level: Some("info".to_string()),
            exec_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PartialSettings {
    role: Option<NodeRole>,
    host: Option<String>,
    port: Option<u16>,
    node_db_url: Option<String>,
    graph_db_url: Option<String>,
    seeds: Option<Vec<String>>,
    subs: Option<Vec<String>>,
    log_level: Option<String>,
    exec_timeout_ms: Option<u64>,
}

/// Load settings from an optional config file and `PLS_`-prefixed
/// environment variables; CLI flags (parsed in `main`) take precedence over
/// both and are overlaid by the caller after `load()` returns. `path`
/// overrides the default `./config.{toml,yaml,json,...}` lookup, matching
/// the CLI's `--config` flag.
pub fn load(path: Option<&str>) -> Result<Settings> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path.unwrap_or("config")).required(false))
        .add_source(config::Environment::with_prefix("PLS").separator("__").try_parsing(true));

    let cfg = builder.build()?;
    let partial: PartialSettings = cfg.try_deserialize()?;

    let mut s = Settings::default();
    if let Some(v) = partial.role {
        s.role = v;
    }
    if let Some(v) = partial.host {
        s.host = v;
    }
    if let Some(v) = partial.port {
        s.port = v;
    }
    if let Some(v) = partial.node_db_url {
        s.node_db_url = v;
    }
    if let Some(v) = partial.graph_db_url {
        s.graph_db_url = v;
    }
    if let Some(v) = partial.seeds {
        s.seeds = v;
    }
    if let Some(v) = partial.subs {
        s.subs = v;
    }
    if let Some(v) = partial.log_level {
        s.log_level = Some(v);
    }
    if let Some(v) = partial.exec_timeout_ms {
        s.exec_timeout_ms = v;
    }

    Ok(s)
}

#[cfg(feature = "unit-tests")]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.port, 4433);
        assert!(s.seeds.is_empty());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let s = load(Some("/nonexistent/propolis-config-for-tests")).unwrap();
        assert_eq!(s.port, 4433);
    }
}
