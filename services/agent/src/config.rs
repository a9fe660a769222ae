//! Agent configuration loading.
//!
//! TOML is the sole config source, resolved against the defaults in the
//! recognized-keys table: a `Raw*` family with `Option` fields mirrors the
//! file shape, and is resolved here into the plain structs the rest of the
//! agent uses.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Resolved config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listener: ListenerConfig,
    pub buffer: BufferConfig,
    pub routing: BTreeMap<String, Vec<RoutingRule>>,
    pub backends: BTreeMap<String, BackendEntry>,
    pub backend_cooldown_s: u64,
    pub router_batch_deadline_s: u64,
    pub ingest_max_skew_s: i64,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub flush_batch_size: usize,
    pub flush_interval_s: u64,
    pub per_source_max: usize,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub backend_name: String,
    pub enabled: bool,
    pub priority: i32,
    /// `None` means "all types pass."
    pub filter: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub enabled: bool,
    pub kind: BackendKind,
}

#[derive(Debug, Clone)]
pub enum BackendKind {
    Managed {
        database_url: String,
    },
    Filesystem {
        base_path: String,
        rotate_size_mb: Option<u64>,
    },
    ObjectStore {
        endpoint: String,
        bucket: String,
        batch_size: usize,
    },
    SearchIndex {
        endpoint: String,
        index: String,
    },
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    listener: Option<RawListenerConfig>,
    buffer: Option<RawBufferConfig>,
    #[serde(default)]
    routing: BTreeMap<String, Vec<RawRoutingRule>>,
    #[serde(default)]
    backends: BTreeMap<String, RawBackendEntry>,
    backend_cooldown_s: Option<u64>,
    router_batch_deadline_s: Option<u64>,
    ingest: Option<RawIngestConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawListenerConfig {
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBufferConfig {
    flush_batch_size: Option<usize>,
    flush_interval_s: Option<u64>,
    per_source_max: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRoutingRule {
    backend_name: String,
    enabled: Option<bool>,
    priority: Option<i32>,
    filter: Option<BTreeSet<String>>,
}

#[derive(Debug, Deserialize)]
struct RawBackendEntry {
    #[serde(rename = "type")]
    kind: String,
    enabled: Option<bool>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    base_path: Option<String>,
    #[serde(default)]
    rotate_size_mb: Option<u64>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    index: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIngestConfig {
    max_skew_s: Option<i64>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 17000;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_FLUSH_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL_S: u64 = 5;
const DEFAULT_PER_SOURCE_MAX: usize = 1000;
const DEFAULT_BACKEND_COOLDOWN_S: u64 = 30;
const DEFAULT_ROUTER_BATCH_DEADLINE_S: u64 = 30;
const DEFAULT_INGEST_MAX_SKEW_S: i64 = 600;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let listener = match raw.listener {
        Some(l) => ListenerConfig {
            host: l.host.unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port: l.port.unwrap_or(DEFAULT_PORT),
            max_connections: l.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        },
        None => ListenerConfig {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        },
    };

    let buffer = match raw.buffer {
        Some(b) => BufferConfig {
            flush_batch_size: b.flush_batch_size.unwrap_or(DEFAULT_FLUSH_BATCH_SIZE),
            flush_interval_s: b.flush_interval_s.unwrap_or(DEFAULT_FLUSH_INTERVAL_S),
            per_source_max: b.per_source_max.unwrap_or(DEFAULT_PER_SOURCE_MAX),
        },
        None => BufferConfig {
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            flush_interval_s: DEFAULT_FLUSH_INTERVAL_S,
            per_source_max: DEFAULT_PER_SOURCE_MAX,
        },
    };

    let mut routing: BTreeMap<String, Vec<RoutingRule>> = BTreeMap::new();
    for (source, rules) in raw.routing {
        let resolved = rules
            .into_iter()
            .map(|r| RoutingRule {
                backend_name: r.backend_name,
                enabled: r.enabled.unwrap_or(true),
                priority: r.priority.unwrap_or(0),
                filter: r.filter,
            })
            .collect();
        routing.insert(source, resolved);
    }

    let mut backends: BTreeMap<String, BackendEntry> = BTreeMap::new();
    for (name, raw_backend) in raw.backends {
        let kind = resolve_backend_kind(&name, raw_backend.kind.as_str(), &raw_backend)?;
        backends.insert(
            name,
            BackendEntry {
                enabled: raw_backend.enabled.unwrap_or(true),
                kind,
            },
        );
    }

    for (source, rules) in &routing {
        for rule in rules {
            if !backends.contains_key(&rule.backend_name) {
                return Err(ConfigError::InvalidValue(format!(
                    "routing.{source} references unknown backend `{}`",
                    rule.backend_name
                )));
            }
        }
    }

    Ok(AgentConfig {
        listener,
        buffer,
        routing,
        backends,
        backend_cooldown_s: raw.backend_cooldown_s.unwrap_or(DEFAULT_BACKEND_COOLDOWN_S),
        router_batch_deadline_s: raw
            .router_batch_deadline_s
            .unwrap_or(DEFAULT_ROUTER_BATCH_DEADLINE_S),
        ingest_max_skew_s: raw
            .ingest
            .and_then(|i| i.max_skew_s)
            .unwrap_or(DEFAULT_INGEST_MAX_SKEW_S),
    })
}

fn resolve_backend_kind(
    name: &str,
    kind: &str,
    raw: &RawBackendEntry,
) -> Result<BackendKind, ConfigError> {
    let missing = |field: &str| {
        ConfigError::MissingField(format!("backends.{name}.{field}"))
    };
    match kind {
        "managed" => Ok(BackendKind::Managed {
            database_url: raw
                .database_url
                .clone()
                .ok_or_else(|| missing("database_url"))?,
        }),
        "filesystem" => Ok(BackendKind::Filesystem {
            base_path: raw.base_path.clone().ok_or_else(|| missing("base_path"))?,
            rotate_size_mb: raw.rotate_size_mb,
        }),
        "object_store" => Ok(BackendKind::ObjectStore {
            endpoint: raw.endpoint.clone().ok_or_else(|| missing("endpoint"))?,
            bucket: raw.bucket.clone().ok_or_else(|| missing("bucket"))?,
            batch_size: raw.batch_size.unwrap_or(100),
        }),
        "search_index" => Ok(BackendKind::SearchIndex {
            endpoint: raw.endpoint.clone().ok_or_else(|| missing("endpoint"))?,
            index: raw.index.clone().ok_or_else(|| missing("index"))?,
        }),
        other => Err(ConfigError::InvalidValue(format!(
            "backends.{name}.type `{other}` is not recognized"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_recognized_keys_table() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.listener.host, "127.0.0.1");
        assert_eq!(cfg.listener.port, 17000);
        assert_eq!(cfg.listener.max_connections, 100);
        assert_eq!(cfg.buffer.flush_batch_size, 100);
        assert_eq!(cfg.buffer.flush_interval_s, 5);
        assert_eq!(cfg.buffer.per_source_max, 1000);
        assert_eq!(cfg.backend_cooldown_s, 30);
        assert_eq!(cfg.router_batch_deadline_s, 30);
        assert_eq!(cfg.ingest_max_skew_s, 600);
    }

    #[test]
    fn routing_rejects_unknown_backend_reference() {
        // A routing table entry referencing a backend that was never
        // declared must fail fast rather than silently drop traffic.
        let toml_str = r#"
            [[routing.default]]
            backend_name = "missing"
        "#;
        let err = load_config_from_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn resolves_a_filesystem_backend() {
        let toml_str = r#"
            [backends.fs1]
            type = "filesystem"
            base_path = "/var/lib/agent/spool"

            [[routing.default]]
            backend_name = "fs1"
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        let entry = cfg.backends.get("fs1").unwrap();
        assert!(entry.enabled);
        match &entry.kind {
            BackendKind::Filesystem { base_path, .. } => assert_eq!(base_path, "/var/lib/agent/spool"),
            other => panic!("expected filesystem backend, got {other:?}"),
        }
    }
}
