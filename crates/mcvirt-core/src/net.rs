//! Async TCP I/O for MCVirt.

use std::time::Duration;

use mcvirt_proto::{McvError, McvResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote node, failing after `timeout`.
pub async fn connect_to(addr: &str, port: u16, timeout: Duration) -> McvResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("connecting to {}", target);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(McvError::CouldNotConnect(format!("{}: {}", target, e)));
        }
        Err(_) => {
            return Err(McvError::CouldNotConnect(format!("{}: timed out", target)));
        }
    };

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given address and port.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> McvResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        McvError::Io(format!("bind {}: {}", addr, e))
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_and_connect() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        connect_to("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect_to("127.0.0.1", port, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, McvError::CouldNotConnect(_)));
        assert!(err.is_connectivity());
    }
}
