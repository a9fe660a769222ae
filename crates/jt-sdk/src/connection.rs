//! Background connection loop: owns the socket, drives reconnect backoff,
//! and drains the shared ring in FIFO order.
//!
//! Runs on a dedicated OS thread inside a single-threaded `tokio` runtime so
//! the public [`crate::Emitter`] API stays synchronous and callable from any
//! application thread without requiring a caller-supplied executor.

use std::sync::Arc;
use std::time::Duration;

use jt_protocol::Payload;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::EmitterError;
use crate::{ConnState, Shared};

const INITIAL_BACKOFF_S: u64 = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_POLL: Duration = Duration::from_millis(500);

pub(crate) fn run(shared: Arc<Shared>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build jt-sdk background runtime");
    runtime.block_on(drive(shared));
}

async fn drive(shared: Arc<Shared>) {
    let mut socket: Option<TcpStream> = None;
    let mut backoff_s = INITIAL_BACKOFF_S;

    loop {
        if socket.is_none() {
            match try_connect(&shared.config.addr).await {
                Ok(stream) => {
                    info!(addr = %shared.config.addr, "emitter connected");
                    socket = Some(stream);
                    backoff_s = INITIAL_BACKOFF_S;
                    let mut state = shared.state.lock().unwrap();
                    if state.conn_state != ConnState::Overflow {
                        state.conn_state = ConnState::Connected;
                    }
                }
                Err(e) => {
                    debug!(error = %e, backoff_s, "emitter connect failed, backing off");
                    tokio::time::sleep(Duration::from_secs(backoff_s)).await;
                    backoff_s = (backoff_s * 2).min(shared.config.reconnect_max_s);
                    continue;
                }
            }
        }

        let next = {
            let state = shared.state.lock().unwrap();
            state.ring.front().cloned()
        };

        let Some(envelope) = next else {
            let should_exit = {
                let state = shared.state.lock().unwrap();
                state.closing && state.ring.is_empty()
            };
            if should_exit {
                let mut state = shared.state.lock().unwrap();
                state.closed = true;
                return;
            }
            let _ = timeout(IDLE_POLL, shared.wake.notified()).await;
            continue;
        };

        let is_goodbye = matches!(envelope.payload, Payload::Goodbye);
        let bytes = match encode_envelope(&envelope) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "emitter dropping unencodable message");
                let mut state = shared.state.lock().unwrap();
                state.ring.pop_front();
                continue;
            }
        };

        let stream = socket.as_mut().expect("socket present in send branch");
        match send(stream, &bytes).await {
            Ok(()) => {
                let mut state = shared.state.lock().unwrap();
                state.ring.pop_front();
                if state.ring.is_empty() && state.conn_state == ConnState::Overflow {
                    state.conn_state = ConnState::Connected;
                }
                drop(state);
                if is_goodbye {
                    let _ = stream.shutdown().await;
                    let mut state = shared.state.lock().unwrap();
                    state.closed = true;
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "emitter write failed, reconnecting");
                socket = None;
                let mut state = shared.state.lock().unwrap();
                if state.conn_state != ConnState::Overflow {
                    state.conn_state = ConnState::Disconnected;
                }
                // envelope is left at the front of the ring (we only peeked)
                // so it is resent first on the next successful connection.
            }
        }
    }
}

async fn try_connect(addr: &str) -> Result<TcpStream, EmitterError> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(EmitterError::Connect {
            addr: addr.to_owned(),
            source,
        }),
        Err(_) => Err(EmitterError::ConnectTimeout {
            addr: addr.to_owned(),
            timeout: CONNECT_TIMEOUT,
        }),
    }
}

fn encode_envelope(envelope: &jt_protocol::Envelope) -> Result<Vec<u8>, EmitterError> {
    Ok(jt_protocol::encode(envelope)?)
}

async fn send(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), EmitterError> {
    stream.write_all(bytes).await.map_err(EmitterError::Write)
}
