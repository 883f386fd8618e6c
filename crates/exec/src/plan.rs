//! Plan ownership, validation, and global lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use brook_common::{BrookError, Result};
use tracing::{debug, warn};

use crate::context::ExecContext;
use crate::future::CompletionFuture;
use crate::node::{ExecNode, NodeId};

pub(crate) struct PlanInner {
    context: ExecContext,
    nodes: Mutex<Vec<Arc<dyn ExecNode>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    finished: CompletionFuture,
}

impl PlanInner {
    pub(crate) fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.nodes
            .lock()
            .expect("plan nodes lock poisoned")
            .get(id.0)
            .cloned()
    }
}

/// Owner and driver of one execution graph.
///
/// The plan exclusively owns its nodes (an arena of `Arc<dyn ExecNode>`
/// slots indexed by [`NodeId`]); nodes refer to each other and back to the
/// plan only through ids and weak handles, so bidirectional edges never form
/// ownership cycles. Cloning an `ExecPlan` clones the handle, not the graph.
///
/// Lifecycle: created empty, nodes added until the first `start_producing`,
/// topology immutable afterwards; torn down only once every node's
/// completion future has resolved.
#[derive(Clone)]
pub struct ExecPlan {
    inner: Arc<PlanInner>,
}

impl ExecPlan {
    /// Construct an empty plan bound to `context`.
    pub fn try_new(context: ExecContext) -> Result<Self> {
        context.validate()?;
        Ok(Self {
            inner: Arc::new(PlanInner {
                context,
                nodes: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                finished: CompletionFuture::pending(),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<PlanInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PlanInner> {
        Arc::downgrade(&self.inner)
    }

    /// The context this plan was bound to at construction.
    pub fn context(&self) -> &ExecContext {
        &self.inner.context
    }

    /// Transfer a constructed node into the plan and wire its input edges.
    ///
    /// Rejected once production has started. The node must have been built
    /// against this plan, and every declared input must already be in the
    /// arena (which makes the graph a DAG by construction).
    pub fn add_node(&self, node: Arc<dyn ExecNode>) -> Result<NodeId> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(BrookError::Graph(
                "cannot add nodes after the plan started producing".to_string(),
            ));
        }
        if !Weak::ptr_eq(node.core().plan_ptr(), &self.downgrade()) {
            return Err(BrookError::Graph(
                "node was constructed against a different plan".to_string(),
            ));
        }
        if node.inputs().len() != node.input_labels().len() {
            return Err(BrookError::Graph(format!(
                "node '{}' declares {} inputs but {} input labels",
                node.label(),
                node.inputs().len(),
                node.input_labels().len()
            )));
        }
        let mut nodes = self.inner.nodes.lock().expect("plan nodes lock poisoned");
        let id = NodeId(nodes.len());
        for input in node.inputs() {
            if input.0 >= nodes.len() {
                return Err(BrookError::Graph(format!(
                    "node '{}' references unknown input {input}",
                    node.label()
                )));
            }
        }
        node.core().set_id(id)?;
        for input in node.inputs().to_vec() {
            nodes[input.0].core().add_output(id);
        }
        nodes.push(node);
        Ok(id)
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Result<Arc<dyn ExecNode>> {
        self.inner
            .node(id)
            .ok_or_else(|| BrookError::Graph(format!("no such node: {id}")))
    }

    /// Number of nodes in the arena.
    pub fn num_nodes(&self) -> usize {
        self.inner.nodes.lock().expect("plan nodes lock poisoned").len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ExecNode>> {
        self.inner
            .nodes
            .lock()
            .expect("plan nodes lock poisoned")
            .clone()
    }

    /// Ids of nodes with no inputs.
    pub fn sources(&self) -> Vec<NodeId> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs().is_empty())
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Ids of nodes with no outputs.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.num_outputs() == 0)
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Check structural consistency without mutating anything.
    ///
    /// Verifies the graph is acyclic, that every node's declared arity
    /// matches its wired edges (sinks excluded from needing outputs, dangling
    /// producers rejected), and that input role labels align with inputs.
    /// Fails on the first violation found.
    pub fn validate(&self) -> Result<()> {
        let nodes = self.snapshot();
        for (i, node) in nodes.iter().enumerate() {
            let id = NodeId(i);
            if node.core().id() != Some(id) {
                return Err(BrookError::Graph(format!(
                    "node '{}' has inconsistent arena id",
                    node.label()
                )));
            }
            if node.inputs().len() != node.input_labels().len() {
                return Err(BrookError::Graph(format!(
                    "node '{}' input labels misaligned with inputs",
                    node.label()
                )));
            }
            for input in node.inputs() {
                if input.0 >= nodes.len() {
                    return Err(BrookError::Graph(format!(
                        "node '{}' references unknown input {input}",
                        node.label()
                    )));
                }
            }
            let wired = node.core().outputs().len();
            if node.num_outputs() != wired {
                return Err(BrookError::Graph(format!(
                    "node '{}' declares {} outputs but {} are wired",
                    node.label(),
                    node.num_outputs(),
                    wired
                )));
            }
        }
        self.topo_order(&nodes).map(|_| ())
    }

    /// Forward topological order: every producer before all of its consumers.
    ///
    /// `add_node` only accepts already-added inputs, so cycles cannot form
    /// through the public API; the check still guards custom node
    /// implementations that wire edges by hand.
    fn topo_order(&self, nodes: &[Arc<dyn ExecNode>]) -> Result<Vec<NodeId>> {
        let n = nodes.len();
        let mut indegree: Vec<usize> = nodes.iter().map(|node| node.inputs().len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop() {
            order.push(NodeId(i));
            for out in nodes[i].core().outputs() {
                indegree[out.0] -= 1;
                if indegree[out.0] == 0 {
                    ready.push(out.0);
                }
            }
        }
        if order.len() != n {
            return Err(BrookError::Graph(
                "graph contains a cycle: some node is (transitively) its own input".to_string(),
            ));
        }
        Ok(order)
    }

    /// Start every node, consumers before their producers.
    ///
    /// At most once per plan. Validates first, then wires the completion
    /// countdown, then starts nodes in reverse topological order so a
    /// producer never pushes into an unstarted consumer. Fail-fast and
    /// non-transactional: the first node start failure aborts the sequence,
    /// already-started nodes are left as-is, and the failure is routed to
    /// the plan's completion future.
    pub fn start_producing(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(BrookError::Graph("plan already started".to_string()));
        }
        let result = self.start_inner();
        if let Err(e) = &result {
            warn!(error = %e, "plan start failed");
            self.inner.finished.mark_finished(Err(e.clone()));
        }
        result
    }

    fn start_inner(&self) -> Result<()> {
        self.validate()?;
        let nodes = self.snapshot();
        if nodes.is_empty() {
            self.inner.finished.mark_finished(Ok(()));
            return Ok(());
        }

        let countdown = Arc::new(PlanCompletion {
            remaining: AtomicUsize::new(nodes.len()),
            first_error: Mutex::new(None),
            finished: self.inner.finished.clone(),
        });
        for node in &nodes {
            let countdown = countdown.clone();
            node.finished()
                .on_complete(move |result| countdown.node_done(result));
        }

        let order = self.topo_order(&nodes)?;
        debug!(nodes = nodes.len(), "starting plan");
        for id in order.iter().rev() {
            let node = &nodes[id.0];
            node.start_producing().map_err(|e| {
                warn!(node = %node.core().describe(), error = %e, "node start failed; aborting plan start");
                e
            })?;
        }
        Ok(())
    }

    /// Stop every node, producers before their consumers. Idempotent.
    pub fn stop_producing(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes = self.snapshot();
        let order = self
            .topo_order(&nodes)
            .unwrap_or_else(|_| (0..nodes.len()).map(NodeId).collect());
        debug!(nodes = nodes.len(), "stopping plan");
        for id in order {
            nodes[id.0].stop_producing();
        }
        // The completion countdown is only installed at start; a plan torn
        // down before starting resolves its future here instead.
        if !self.inner.started.load(Ordering::SeqCst) {
            self.inner.finished.mark_finished(Ok(()));
        }
    }

    /// Future resolving once every node's future has resolved; the first
    /// node error wins, success otherwise.
    pub fn finished(&self) -> CompletionFuture {
        self.inner.finished.clone()
    }
}

struct PlanCompletion {
    remaining: AtomicUsize,
    first_error: Mutex<Option<BrookError>>,
    finished: CompletionFuture,
}

impl PlanCompletion {
    fn node_done(&self, result: &Result<()>) {
        if let Err(e) = result {
            let mut slot = self
                .first_error
                .lock()
                .expect("plan completion lock poisoned");
            if slot.is_none() {
                *slot = Some(e.clone());
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let error = self
                .first_error
                .lock()
                .expect("plan completion lock poisoned")
                .take();
            self.finished
                .mark_finished(error.map_or(Ok(()), Err));
        }
    }
}

/// One line per node: `#id kind(label) inputs=[..] outputs=[..]`.
impl fmt::Display for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ExecPlan {{")?;
        for (i, node) in self.snapshot().iter().enumerate() {
            writeln!(
                f,
                "  #{i} {}({}) inputs={:?} outputs={:?}",
                node.kind_name(),
                node.label(),
                node.inputs(),
                node.core().outputs(),
            )?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
