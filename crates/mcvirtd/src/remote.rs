//! Calls to peer daemons.
//!
//! A peer is called with the cluster-user credentials it issued to this
//! node. The envelope marks the call as not cluster-master (the peer must
//! not fan out again) and as lock-holding (this node already holds the
//! object locks), and carries the caller's ignore flags and, for
//! high-level requests, the human user on whose behalf it runs.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use mcvirt_core::transport::PeerAddr;
use mcvirt_proto::{Envelope, McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;

/// Envelope for calling `peer` as this node.
async fn peer_envelope(node: &NodeState, ctx: &CallContext, peer: &str, req: &Request) -> McvResult<Envelope> {
    let global = node.config.global.get().await;
    let record = global
        .cluster
        .nodes
        .get(peer)
        .ok_or_else(|| McvError::NodeDoesNotExist(peer.to_string()))?;

    let mut envelope = Envelope::with_password(&record.username, &record.password);
    envelope.cluster_master = Some(false);
    envelope.has_lock = true;
    envelope.ignore_cluster = ctx.ignore_cluster;
    envelope.ignore_drbd = ctx.ignore_drbd;
    if !req.is_internal() {
        envelope.proxy_user = ctx.proxy_name().map(String::from);
    }
    Ok(envelope)
}

/// Send one request to an address with an explicit envelope.
pub async fn send(node: &NodeState, addr: &PeerAddr, envelope: Envelope, req: Request) -> McvResult<Outcome> {
    debug!("-> {} {}", addr.hostname, req.name());
    let response = node.transport.send_request(addr, envelope, req).await?;
    response.result
}

/// Call a peer of this node.
pub async fn call(node: &NodeState, ctx: &CallContext, peer: &str, req: Request) -> McvResult<Outcome> {
    let envelope = peer_envelope(node, ctx, peer, &req).await?;
    let addr = node.peer_addr(peer).await?;
    send(node, &addr, envelope, req).await
}

/// Call a peer and return only its reply.
pub async fn query(node: &NodeState, ctx: &CallContext, peer: &str, req: Request) -> McvResult<Reply> {
    Ok(call(node, ctx, peer, req).await?.reply)
}

/// Run a query on every node in `nodes` (this node included, when named)
/// and collect each node's result. Nothing is undone on failure; with
/// `ignore_cluster` unreachable peers are recorded and left out.
pub async fn run_remote_command(
    node: &NodeState,
    ctx: &CallContext,
    nodes: &[String],
    req: Request,
) -> BTreeMap<String, McvResult<Reply>> {
    let mut results = BTreeMap::new();
    for target in nodes {
        let result = if node.is_local(target) {
            crate::ops::execute(node, ctx, req.clone()).await.map(|o| o.reply)
        } else {
            query(node, ctx, target, req.clone()).await
        };
        match result {
            Err(e) if e.is_connectivity() && ctx.ignore_cluster => {
                warn!("node {} is inaccessible: {}", target, e);
                ctx.mark_inaccessible(target);
            }
            other => {
                results.insert(target.clone(), other);
            }
        }
    }
    results
}
