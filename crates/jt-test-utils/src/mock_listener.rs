//! A minimal LDJSON listener for tests: binds to an ephemeral port, accepts
//! one connection at a time, and records every envelope it decodes.

use std::sync::{Arc, Mutex};

use jt_protocol::Envelope;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct MockAgentListener {
    local_addr: std::net::SocketAddr,
    received: Arc<Mutex<Vec<Envelope>>>,
    _accept_task: JoinHandle<()>,
}

impl MockAgentListener {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let recv_for_task = received.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let recv = recv_for_task.clone();
                tokio::spawn(handle_connection(socket, recv));
            }
        });
        Ok(MockAgentListener {
            local_addr,
            received,
            _accept_task: accept_task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn addr_string(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

async fn handle_connection(socket: TcpStream, received: Arc<Mutex<Vec<Envelope>>>) {
    let mut reader = BufReader::new(socket);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                if let Ok(env) = jt_protocol::decode(&line) {
                    received.lock().unwrap().push(env);
                }
            }
            Err(_) => return,
        }
    }
}
