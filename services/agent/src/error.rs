//! Agent-wide error taxonomy. Nothing below the router surfaces these to
//! application code; they exist for logging, tests, and the adapters that
//! need a typed result to fold into breaker counters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend rejected batch: {0}")]
    Rejected(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}
