//! Internal error taxonomy for the background connection loop.
//!
//! Nothing here crosses into application code: the public `Emitter` API
//! never returns a `Result` (see the crate-level doc comment), so these
//! variants exist purely so `connection::drive` can use `?` internally and
//! log a single structured cause instead of a handful of ad hoc matches.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] jt_protocol::ProtocolError),
}
