//! Operation dispatch.
//!
//! A `match` on the request area routes to the handler of that area. The
//! object a mutating request changes is locked for the whole call first.

pub mod node;

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use mcvirt_proto::request::{DrbdOp, HardDriveOp, StorageOp, VmOp};
use mcvirt_proto::{McvResult, Outcome, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;

async fn vm_key(node: &NodeState, name: &str) -> String {
    match node.config.vm_by_name(name).await {
        Ok(vm) => format!("vm/{}", vm.id),
        Err(_) => format!("vm/{}", name),
    }
}

/// Key of the object lock a request needs, if any. Internal requests run
/// under the locks of the request that issued them.
async fn lock_key(node: &NodeState, req: &Request) -> Option<String> {
    if !req.is_mutating() || req.is_internal() {
        return None;
    }
    match req {
        Request::Vm(op) => {
            let name = match op {
                VmOp::Create { name, .. }
                | VmOp::Delete { name, .. }
                | VmOp::Start { name, .. }
                | VmOp::Stop { name }
                | VmOp::Shutdown { name }
                | VmOp::Reset { name }
                | VmOp::Register { name, .. }
                | VmOp::Unregister { name }
                | VmOp::SetLock { name, .. }
                | VmOp::SetDeleteProtection { name, .. }
                | VmOp::Migrate { name, .. }
                | VmOp::Move { name, .. }
                | VmOp::Clone { name, .. }
                | VmOp::Duplicate { name, .. }
                | VmOp::Update { name, .. }
                | VmOp::Backup { name, .. } => name,
                _ => return None,
            };
            Some(vm_key(node, name).await)
        }
        Request::HardDrive(op) => {
            let vm = match op {
                HardDriveOp::Create { vm, .. }
                | HardDriveOp::Delete { vm, .. }
                | HardDriveOp::Resize { vm, .. }
                | HardDriveOp::Verify { vm, .. }
                | HardDriveOp::Resync { vm, .. }
                | HardDriveOp::SetSyncState { vm, .. } => vm,
                _ => return None,
            };
            Some(vm_key(node, vm).await)
        }
        Request::Storage(op) => {
            let name = match op {
                StorageOp::Create { name, .. }
                | StorageOp::Delete { name }
                | StorageOp::AddNode { name, .. }
                | StorageOp::RemoveNode { name, .. }
                | StorageOp::SetLocation { name, .. }
                | StorageOp::SetShared { name, .. } => name,
                _ => return None,
            };
            let key = match node.config.storage_backend_by_name(name).await {
                Ok(sb) => sb.id,
                Err(_) => name.clone(),
            };
            Some(format!("sb/{}", key))
        }
        Request::Drbd(DrbdOp::OutOfSync { .. }) => None,
        Request::Drbd(_) | Request::Cluster(_) | Request::Node(_) | Request::Network(_) => {
            Some("cluster".to_string())
        }
        Request::Auth(_) => Some("users".to_string()),
        _ => None,
    }
}

/// Run a request on this node.
///
/// Returns a boxed future to break the recursive async cycle:
/// `ops::execute → handler → Function::run → transaction::execute_on → ops::execute`
pub fn execute<'a>(
    node: &'a NodeState,
    ctx: &'a CallContext,
    req: Request,
) -> Pin<Box<dyn Future<Output = McvResult<Outcome>> + Send + 'a>> {
    Box::pin(async move {
        let _lock = match lock_key(node, &req).await {
            Some(key) => node.locks.acquire(ctx, &key).await,
            None => None,
        };
        debug!("processing {}", req.name());

        match req {
            Request::Auth(op) => crate::auth::handle(node, ctx, op).await,
            Request::Node(op) => self::node::handle(node, ctx, op).await,
            Request::Volume(op) => crate::volume::handle(node, ctx, op).await,
            Request::Storage(op) => crate::storage::handle(node, ctx, op).await,
            Request::Drbd(op) => crate::drbd::handle(node, ctx, op).await,
            Request::HardDrive(op) => crate::hard_drive::handle(node, ctx, op).await,
            Request::Vm(op) => crate::vm::handle(node, ctx, op).await,
            Request::Cluster(op) => crate::cluster::handle(node, ctx, op).await,
            Request::Network(op) => crate::network::handle(node, ctx, op).await,
            Request::Cert(op) => crate::certificate::handle(node, ctx, op).await,
        }
    })
}
