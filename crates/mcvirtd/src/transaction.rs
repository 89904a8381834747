//! Saga coordinator.
//!
//! A [`Function`] is one request run on a set of nodes: locally first,
//! then on each remote node in order, one at a time. Every node that
//! completes is registered with the newest open [`Transaction`] of the
//! call context together with the request that undoes it, either the one
//! the handler returned in its `Outcome` or the one the `Function`
//! declared.
//!
//! When a step fails the whole stack unwinds: newest transaction first,
//! newest step first, each compensation sent to the node the step ran on.
//! While unwinding nothing registers and no transaction opens, so an undo
//! never triggers another undo.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use mcvirt_proto::{McvError, McvResult, Outcome, Reply, Request};

use crate::context::CallContext;
use crate::daemon::NodeState;
use crate::{ops, remote};

/// A completed step and how to reverse it.
#[derive(Debug, Clone)]
struct Step {
    node: String,
    name: &'static str,
    undo: Option<Request>,
}

#[derive(Debug, Default)]
pub struct TransactionStack {
    frames: Vec<Vec<Step>>,
    undo_state: bool,
}

impl TransactionStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn in_undo(&self) -> bool {
        self.undo_state
    }

    fn open(&mut self) -> Option<usize> {
        if self.undo_state {
            return None;
        }
        self.frames.push(Vec::new());
        Some(self.frames.len())
    }

    /// Close frame `depth`. Steps of a nested frame stay undoable by the
    /// enclosing one; closing the outermost frame drops the stack.
    fn close(&mut self, depth: usize) {
        if self.frames.len() != depth {
            return;
        }
        if let Some(steps) = self.frames.pop() {
            if let Some(parent) = self.frames.last_mut() {
                parent.extend(steps);
            }
        }
    }

    fn register(&mut self, step: Step) {
        if self.undo_state {
            return;
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.push(step);
        }
    }

    /// Enter the undo state and take every step, newest first.
    fn begin_undo(&mut self) -> Vec<Step> {
        self.undo_state = true;
        let mut steps = Vec::new();
        while let Some(frame) = self.frames.pop() {
            steps.extend(frame.into_iter().rev());
        }
        steps
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.undo_state = false;
    }
}

/// Handle on one open transaction.
#[must_use]
pub struct Transaction {
    depth: Option<usize>,
}

impl Transaction {
    pub fn begin(ctx: &CallContext) -> Self {
        Self {
            depth: ctx.transactions().open(),
        }
    }

    pub fn finish(self, ctx: &CallContext) {
        if let Some(depth) = self.depth {
            ctx.transactions().close(depth);
        }
    }

    /// Finish on success; on failure unwind everything registered so far,
    /// unless a failed step already did.
    pub async fn settle<T>(
        self,
        node: &NodeState,
        ctx: &CallContext,
        result: McvResult<T>,
    ) -> McvResult<T> {
        match result {
            Ok(value) => {
                self.finish(ctx);
                Ok(value)
            }
            Err(e) => {
                let still_open = match self.depth {
                    Some(depth) => ctx.transactions().depth() >= depth,
                    None => false,
                };
                if still_open {
                    Err(function_failed(node, ctx, e).await)
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Run `req` on `target`, locally or through the peer's daemon.
pub async fn execute_on(
    node: &NodeState,
    ctx: &CallContext,
    target: &str,
    req: Request,
) -> McvResult<Outcome> {
    if node.is_local(target) {
        ops::execute(node, ctx, req).await
    } else {
        remote::call(node, ctx, target, req).await
    }
}

/// Unwind the transaction stack of `ctx` and return the error to raise.
pub async fn function_failed(node: &NodeState, ctx: &CallContext, cause: McvError) -> McvError {
    let steps = {
        let mut stack = ctx.transactions();
        if stack.in_undo() {
            return cause;
        }
        stack.begin_undo()
    };

    for step in steps {
        let Some(undo) = step.undo else {
            continue;
        };
        warn!("undoing {} on {} ({})", step.name, step.node, undo.name());
        match execute_on(node, ctx, &step.node, undo).await {
            Ok(_) => {}
            Err(e) if e.is_connectivity() && ctx.ignore_cluster && !node.is_local(&step.node) => {
                warn!("skipping undo on unreachable node {}", step.node);
                ctx.mark_inaccessible(&step.node);
            }
            Err(e) => {
                error!("undo of {} on {} failed: {}", step.name, step.node, e);
                ctx.transactions().reset();
                return McvError::UndoFailed {
                    cause: Box::new(cause),
                    undo: Box::new(e),
                };
            }
        }
    }

    ctx.transactions().reset();
    cause
}

/// Register a step that ran on `node` outside a [`Function`] with the
/// newest open transaction of `ctx`.
pub fn register_step(ctx: &CallContext, node: &str, name: &'static str, undo: Option<Request>) {
    ctx.transactions().register(Step {
        node: node.to_string(),
        name,
        undo,
    });
}

/// One request fanned out over a set of nodes.
pub struct Function {
    request: Request,
    nodes: Vec<String>,
    undo: Option<Request>,
}

impl Function {
    /// Runs on this node only unless [`Function::on`] says otherwise.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            nodes: Vec::new(),
            undo: None,
        }
    }

    pub fn on<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_node(self, node: &str) -> Self {
        self.on([node])
    }

    /// Compensation used on nodes whose handler returned none.
    pub fn undo(mut self, req: Request) -> Self {
        self.undo = Some(req);
        self
    }

    fn targets(&self, node: &NodeState) -> Vec<String> {
        if self.nodes.is_empty() {
            return vec![node.hostname.clone()];
        }
        let mut targets = Vec::with_capacity(self.nodes.len());
        if self.nodes.iter().any(|n| node.is_local(n)) {
            targets.push(node.hostname.clone());
        }
        for n in &self.nodes {
            if !node.is_local(n) && !targets.contains(n) {
                targets.push(n.clone());
            }
        }
        targets
    }

    /// Run and return one reply per node that ran it.
    pub async fn run_all(self, node: &NodeState, ctx: &CallContext) -> McvResult<BTreeMap<String, Reply>> {
        let name = self.request.name();
        let mut replies = BTreeMap::new();

        for target in self.targets(node) {
            debug!("{} on {}", name, target);
            match execute_on(node, ctx, &target, self.request.clone()).await {
                Ok(outcome) => {
                    let undo = outcome.compensation.map(|b| *b).or_else(|| self.undo.clone());
                    ctx.transactions().register(Step {
                        node: target.clone(),
                        name,
                        undo,
                    });
                    replies.insert(target, outcome.reply);
                }
                Err(e) if e.is_connectivity() && ctx.ignore_cluster && !node.is_local(&target) => {
                    warn!("{} skipped on unreachable node {}: {}", name, target, e);
                    ctx.mark_inaccessible(&target);
                }
                Err(e) => {
                    debug!("{} failed on {}: {}", name, target, e);
                    return Err(function_failed(node, ctx, e).await);
                }
            }
        }
        Ok(replies)
    }

    /// Run and return the local reply, or the first remote one.
    pub async fn run(self, node: &NodeState, ctx: &CallContext) -> McvResult<Reply> {
        let local = node.hostname.clone();
        let mut replies = self.run_all(node, ctx).await?;
        if let Some(reply) = replies.remove(&local) {
            return Ok(reply);
        }
        Ok(replies.into_values().next().unwrap_or(Reply::Unit))
    }
}
