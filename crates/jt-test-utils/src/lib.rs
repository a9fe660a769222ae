//! jt-test-utils: shared fixtures for the job-telemetry workspace's
//! integration tests.

pub mod fixtures;
pub mod mock_listener;

pub use mock_listener::MockAgentListener;

#[cfg(test)]
mod tests {
    use super::*;
    use jt_protocol::Level;

    #[tokio::test]
    async fn mock_listener_records_decoded_envelopes() {
        use tokio::io::AsyncWriteExt;

        let listener = MockAgentListener::start().await.unwrap();
        let mut socket = tokio::net::TcpStream::connect(listener.local_addr())
            .await
            .unwrap();

        let env = fixtures::event("svc", Level::Info, "hi");
        let bytes = jt_protocol::encode(&env).unwrap();
        socket.write_all(&bytes).await.unwrap();
        socket.flush().await.unwrap();

        for _ in 0..50 {
            if listener.received_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let received = listener.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].src, "svc");
    }
}
