//! Length-prefixed bincode framing.
//!
//! Wire format: `u32 length prefix (big-endian) + bincode(payload)`.
//! Requests carry `(Envelope, Request)`, responses a `Response`.

use mcvirt_proto::constants::MAX_FRAME_SIZE;
use mcvirt_proto::{Envelope, McvError, McvResult, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> McvResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(value)
        .map_err(|e| McvError::Protocol(format!("serialize: {}", e)))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(McvError::Protocol(format!("frame too large: {} bytes", data.len())));
    }
    writer
        .write_u32(data.len() as u32)
        .await
        .map_err(|e| McvError::NetworkError(e.to_string()))?;
    writer
        .write_all(&data)
        .await
        .map_err(|e| McvError::NetworkError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| McvError::NetworkError(e.to_string()))
}

/// Read one frame. Returns `None` when the peer closed the connection
/// cleanly before a new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> McvResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(McvError::NetworkError(e.to_string())),
    };

    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(McvError::Protocol(format!("invalid frame length {}", len)));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| McvError::NetworkError(e.to_string()))?;

    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|e| McvError::Protocol(format!("deserialize: {}", e)))
}

/// Send one request on an open stream and wait for its response.
pub async fn call<S>(stream: &mut S, envelope: &Envelope, req: &Request) -> McvResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &(envelope, req)).await?;
    match read_frame::<_, Response>(stream).await? {
        Some(response) if response.id == envelope.id => Ok(response),
        Some(response) => Err(McvError::Protocol(format!(
            "response id {} does not match request id {}",
            response.id, envelope.id
        ))),
        None => Err(McvError::NetworkError("connection closed before response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_proto::request::NodeOp;
    use mcvirt_proto::{Outcome, Reply};

    #[tokio::test]
    async fn test_call_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (env, req): (Envelope, Request) = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(req, Request::Node(NodeOp::Version));
            let response = Response {
                id: env.id,
                session_id: Some("abc".into()),
                result: Ok(Outcome::reply(Reply::Text("1.0".into()))),
            };
            write_frame(&mut server, &response).await.unwrap();
        });

        let mut env = Envelope::with_password("admin", "pw");
        env.id = 7;
        let response = call(&mut client, &env, &Request::Node(NodeOp::Version))
            .await
            .unwrap();
        assert_eq!(response.session_id.as_deref(), Some("abc"));
        assert_eq!(response.result.unwrap().reply, Reply::Text("1.0".into()));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let frame: Option<Response> = read_frame(&mut server).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();
        let err = read_frame::<_, Response>(&mut server).await.unwrap_err();
        assert!(matches!(err, McvError::Protocol(_)));
    }
}
