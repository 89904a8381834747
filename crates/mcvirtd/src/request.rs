//! Request pipeline: accept, authenticate, dispatch, respond.
//!
//!   accept_loop → spawn(handle_client) → read frame → handle_request
//!   → admission (auth + context) → version gate → ops::execute → respond
//!
//! Admission is serialised by the node's admission lock; execution is not.
//! Mutating operations serialise on their object lock inside
//! `ops::execute`.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use mcvirt_core::frame;
use mcvirt_proto::constants::MCVIRT_PROTO_VER;
use mcvirt_proto::{Envelope, McvError, McvResult, Outcome, Request, Response};

use crate::context::CallContext;
use crate::daemon::{NodeState, SharedNode};
use crate::{auth, cluster, ops};

/// Accept client connections until shutdown is signalled.
pub async fn accept_loop(
    node: SharedNode,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> McvResult<()> {
    let shutdown_notify = node.shutdown_notify.clone();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        stream.set_nodelay(true).ok();
                        let node = node.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            let result = match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => handle_client(node, stream).await,
                                    Err(e) => Err(McvError::NetworkError(format!("TLS handshake: {}", e))),
                                },
                                None => handle_client(node, stream).await,
                            };
                            if let Err(e) = result {
                                debug!("client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Serve one connection: one response frame per request frame.
async fn handle_client<S>(node: SharedNode, mut stream: S) -> McvResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some((envelope, req)) = frame::read_frame::<_, (Envelope, Request)>(&mut stream).await? {
        let response = handle_request(&node, envelope, req).await;
        frame::write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// Authenticate and run one request.
pub async fn handle_request(node: &NodeState, envelope: Envelope, req: Request) -> Response {
    let id = envelope.id;
    if envelope.proto_ver != MCVIRT_PROTO_VER {
        return Response::error(
            id,
            McvError::Protocol(format!("unsupported protocol version {}", envelope.proto_ver)),
        );
    }

    let ctx = {
        let _admission = node.admission.lock().await;
        match auth::authenticate(node, &envelope).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(
                    "rejected {} from {}: {}",
                    req.name(),
                    envelope.username.as_deref().unwrap_or("<anonymous>"),
                    e
                );
                return Response::error(id, e);
            }
        }
    };

    let result = run(node, &ctx, req).await;
    Response {
        id,
        session_id: ctx.session_id.clone(),
        result,
    }
}

async fn run(node: &NodeState, ctx: &CallContext, req: Request) -> McvResult<Outcome> {
    let name = req.name();
    if req.is_internal() && !ctx.may_call_internal() {
        return Err(McvError::PermissionDenied(format!("{} is an internal operation", name)));
    }

    let _pause = node.sessions.pause(ctx.session_id.as_deref());

    if ctx.cluster_master && req.is_mutating() && !req.is_internal() {
        cluster::check_node_versions(node, ctx).await?;
    }

    debug!("{} from {} (master={})", name, ctx.user, ctx.cluster_master);
    let result = ops::execute(node, ctx, req).await;
    if let Err(e) = &result {
        debug!("{} failed: {}", name, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_proto::constants::INITIAL_ADMIN_USER;
    use mcvirt_proto::request::{NodeOp, VolumeOp, VolumeRef};
    use mcvirt_proto::Reply;

    use crate::testutil::single_node;

    #[tokio::test]
    async fn test_login_returns_session() {
        let node = single_node("n1").await;
        let response = handle_request(
            &node,
            Envelope::with_password(INITIAL_ADMIN_USER, "admin-pw"),
            Request::Node(NodeOp::Version),
        )
        .await;
        let session = response.session_id.clone().unwrap();
        assert_eq!(response.result.unwrap().reply, Reply::Text("10.0.0".into()));

        let response = handle_request(
            &node,
            Envelope::with_session(INITIAL_ADMIN_USER, &session),
            Request::Node(NodeOp::Version),
        )
        .await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_wrong_protocol_version() {
        let node = single_node("n1").await;
        let mut envelope = Envelope::with_password(INITIAL_ADMIN_USER, "admin-pw");
        envelope.proto_ver = 0x7f;
        let response = handle_request(&node, envelope, Request::Node(NodeOp::Version)).await;
        assert!(matches!(response.result, Err(McvError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_internal_ops_need_machine_or_superuser() {
        let node = single_node("n1").await;
        let admin = CallContext::internal();
        auth::handle(
            &node,
            &admin,
            mcvirt_proto::request::AuthOp::CreateUser {
                username: "alice".into(),
                password: "pw".into(),
                kind: mcvirt_proto::auth::UserKind::Local,
            },
        )
        .await
        .unwrap();

        let req = Request::Volume(VolumeOp::Exists {
            volume: VolumeRef::new("sb-0", "v"),
        });
        let response = handle_request(&node, Envelope::with_password("alice", "pw"), req).await;
        assert!(matches!(response.result, Err(McvError::PermissionDenied(_))));
    }
}
