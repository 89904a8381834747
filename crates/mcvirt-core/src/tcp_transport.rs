//! TCP-based peer transport.
//!
//! Uses [`ConnCache`] for connection pooling to avoid the TCP handshake
//! on repeated requests to the same peer during a saga.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use mcvirt_proto::{Envelope, McvResult, Request, Response};

use crate::conn_cache::ConnCache;
use crate::frame;
use crate::transport::{PeerAddr, Transport};

/// Plain TCP transport.
pub struct TcpTransport {
    cache: ConnCache<TcpStream>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// `max_conns_per_peer` controls the pool size per peer.
    pub fn new(max_conns_per_peer: usize, connect_timeout: Duration) -> Self {
        Self {
            cache: ConnCache::new(max_conns_per_peer),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn send_request(
        &self,
        peer: &PeerAddr,
        envelope: Envelope,
        req: Request,
    ) -> McvResult<Response> {
        let key = peer.key();
        let mut stream = match self.cache.get(&key) {
            Some(stream) => stream,
            None => crate::net::connect_to(&peer.ip_address, peer.port, self.connect_timeout).await?,
        };

        match frame::call(&mut stream, &envelope, &req).await {
            Ok(response) => {
                // Return the connection to the pool for reuse
                self.cache.put(&key, stream);
                Ok(response)
            }
            Err(e) => {
                debug!("request to {} failed: {}", peer, e);
                self.cache.clear_peer(&key);
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> McvResult<()> {
        self.cache.clear_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_proto::request::NodeOp;
    use mcvirt_proto::{McvError, Outcome, Reply};

    #[tokio::test]
    async fn test_tcp_round_trip_reuses_connection() {
        let listener = crate::net::create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // One accepted connection serves both requests.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut served = 0;
            while let Some((env, _req)) =
                frame::read_frame::<_, (Envelope, Request)>(&mut stream).await.unwrap()
            {
                let response = Response {
                    id: env.id,
                    session_id: None,
                    result: Ok(Outcome::reply(Reply::Text("10.0".into()))),
                };
                frame::write_frame(&mut stream, &response).await.unwrap();
                served += 1;
            }
            served
        });

        let transport = TcpTransport::new(4, Duration::from_secs(5));
        let peer = PeerAddr::new("n2", "127.0.0.1", port);
        for id in 1..=2 {
            let mut env = Envelope::with_password("admin", "pw");
            env.id = id;
            let response = transport
                .send_request(&peer, env, Request::Node(NodeOp::Version))
                .await
                .unwrap();
            assert_eq!(response.result.unwrap().reply, Reply::Text("10.0".into()));
        }
        transport.shutdown().await.unwrap();
        assert_eq!(server.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let transport = TcpTransport::new(1, Duration::from_millis(200));
        let listener = crate::net::create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let peer = PeerAddr::new("n9", "127.0.0.1", port);
        let err = transport
            .send_request(&peer, Envelope::default(), Request::Node(NodeOp::Version))
            .await
            .unwrap_err();
        assert!(matches!(err, McvError::CouldNotConnect(_)));
    }
}
