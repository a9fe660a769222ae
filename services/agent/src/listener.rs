//! Stream Listener: accepts LDJSON connections and forwards decoded
//! envelopes, in receive order, to the correlation engine.
//!
//! Adapted from a connect-then-hand-off-to-a-pool accept loop to an inline
//! per-connection read loop, since here each connection IS a single source
//! stream rather than a pooled client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::correlation::CorrelationEngine;
use crate::error::AgentError;

pub struct StreamListener {
    listener: TcpListener,
    max_connections: usize,
    active_connections: Arc<AtomicUsize>,
}

impl StreamListener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!(addr = %config.bind_addr(), "listener bound");
        Ok(StreamListener {
            listener,
            max_connections: config.max_connections,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves. Each accepted socket is
    /// handled on its own task so one slow connection never blocks another.
    pub async fn run(self, correlation: Arc<CorrelationEngine>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.dispatch(socket, addr, &correlation),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("listener stopping accept loop");
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, socket: TcpStream, addr: std::net::SocketAddr, correlation: &Arc<CorrelationEngine>) {
        if self.active_connections.load(Ordering::Acquire) >= self.max_connections {
            debug!(%addr, "admission cap reached, closing new connection");
            drop(socket);
            return;
        }
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        let active = self.active_connections.clone();
        let correlation = correlation.clone();
        tokio::spawn(async move {
            handle_connection(socket, addr, correlation).await;
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

async fn handle_connection(socket: TcpStream, addr: std::net::SocketAddr, correlation: Arc<CorrelationEngine>) {
    let mut reader = BufReader::new(socket);
    let mut line = Vec::new();
    let mut src: Option<String> = None;
    let mut received = 0u64;
    let mut dropped = 0u64;

    loop {
        line.clear();
        let read = match read_frame(&mut reader, &mut line).await {
            Ok(n) => n,
            Err(e) => {
                debug!(%addr, error = %e, "connection read error");
                break;
            }
        };
        if read == 0 {
            break; // EOF
        }
        if line.len() > jt_protocol::MAX_FRAME_BYTES {
            warn!(%addr, len = line.len(), "oversize frame, skipping line");
            dropped += 1;
            continue;
        }

        match jt_protocol::decode(&line) {
            Ok(envelope) => {
                received += 1;
                if src.is_none() {
                    src = Some(envelope.src.clone());
                    debug!(%addr, src = %envelope.src, "source identified");
                }
                let is_goodbye = matches!(envelope.payload, jt_protocol::Payload::Goodbye);
                correlation.process(envelope).await;
                if is_goodbye {
                    debug!(%addr, "goodbye received, closing connection");
                    break;
                }
            }
            Err(e) => {
                warn!(%addr, error = %e, "decode error, keeping connection open");
                dropped += 1;
            }
        }
    }

    info!(%addr, src = src.as_deref().unwrap_or("unknown"), received, dropped, "connection closed");
}

/// Reads up to a newline, but never buffers past the frame cap: once the
/// accumulated line would exceed it, bytes are discarded until the next `\n`
/// while still reporting the oversize condition to the caller.
async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
) -> std::io::Result<usize> {
    loop {
        let n = reader.read_until(b'\n', out).await?;
        if n == 0 {
            return Ok(0);
        }
        if out.len() <= jt_protocol::MAX_FRAME_BYTES || out.ends_with(b"\n") {
            return Ok(out.len());
        }
        // Still mid-line and already oversize: keep draining until `\n`.
    }
}
