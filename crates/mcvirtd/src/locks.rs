//! Per-object write locks.
//!
//! Mutating requests lock the object they change (`vm/<id>`, `hd/<id>`,
//! `sb/<id>`, `cluster`) for their whole duration. A request that already
//! holds a key, or whose caller declared it holds the locks, passes
//! straight through.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::context::CallContext;

#[derive(Default)]
pub struct ObjectLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Releases the lock and forgets it in the context when dropped.
pub struct LockGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    ctx: &'a CallContext,
    key: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.ctx.remove_held_lock(&self.key);
        debug!("released lock {}", self.key);
    }
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key` for `ctx`. Returns `None` when nothing had to be locked.
    pub async fn acquire<'a>(&self, ctx: &'a CallContext, key: &str) -> Option<LockGuard<'a>> {
        if ctx.has_lock || ctx.holds_lock(key) {
            return None;
        }
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        ctx.add_held_lock(key);
        debug!("acquired lock {}", key);
        Some(LockGuard {
            _guard: guard,
            ctx,
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reentrant_for_same_context() {
        let locks = ObjectLocks::new();
        let ctx = CallContext::internal();
        let outer = locks.acquire(&ctx, "vm/1").await;
        assert!(outer.is_some());
        assert!(locks.acquire(&ctx, "vm/1").await.is_none());
        drop(outer);
        assert!(locks.acquire(&ctx, "vm/1").await.is_some());
    }

    #[tokio::test]
    async fn test_excludes_other_contexts() {
        let locks = Arc::new(ObjectLocks::new());
        let ctx = CallContext::internal();
        let _held = locks.acquire(&ctx, "vm/1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let ctx = CallContext::internal();
            let acquired = other.acquire(&ctx, "vm/1").await.is_some();
            acquired
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(_held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_has_lock_skips() {
        let locks = ObjectLocks::new();
        let mut ctx = CallContext::internal();
        ctx.has_lock = true;
        assert!(locks.acquire(&ctx, "vm/1").await.is_none());
    }
}
