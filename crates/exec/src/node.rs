//! The operator contract and its shared state block.
//!
//! Two independent protocols share the [`ExecNode`] interface: a data
//! protocol (`input_received` / `error_received` / `input_finished`) pushed
//! from producers to consumers, and a control protocol (`start` / `pause` /
//! `resume` / `stop`) flowing from consumers to producers. Both may be
//! invoked concurrently from multiple threads, and reentrantly: a pushed
//! batch may synchronously trigger a pause call back into the pushing node.
//! [`NodeCore`] therefore updates its own state strictly before notifying
//! neighbors, and never holds a lock across a neighbor call.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use brook_common::{BrookError, MetricsRegistry, Result};
use tracing::{debug, warn};

use crate::future::CompletionFuture;
use crate::plan::{ExecPlan, PlanInner};

/// Stable arena index identifying a node within its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// One operator instance in the execution graph.
///
/// Implementations embed a [`NodeCore`] and return it from [`ExecNode::core`];
/// the structural accessors are derived from it. Data-protocol methods must
/// only be called after `start_producing` returned successfully, from any
/// thread, in any per-edge order.
pub trait ExecNode: Send + Sync {
    /// Registry kind name ("filter", "source", ...).
    fn kind_name(&self) -> &'static str;

    /// Shared structural/state block.
    fn core(&self) -> &NodeCore;

    // ---- data protocol (called by an input node on this node) ----

    /// Deliver one batch from `input` under its producer-assigned sequence
    /// number. Batches for one edge may arrive out of sequence order.
    fn input_received(&self, input: NodeId, seq: usize, batch: RecordBatch);

    /// Signal that `input` failed. Implementations forward the error to
    /// their own outputs, stop pulling input, and fail their future.
    fn error_received(&self, input: NodeId, error: BrookError);

    /// Declare that `input` delivers exactly `seq_stop` batches (numbered
    /// `0..seq_stop`). May arrive before all of those batches have.
    fn input_finished(&self, input: NodeId, seq_stop: usize);

    // ---- lifecycle / control protocol ----

    /// One-time initialization. Must not recurse into inputs' starts; the
    /// plan orders those. Calling it twice is a precondition violation.
    fn start_producing(&self) -> Result<()>;

    /// Advisory backpressure from one output. Counted, best-effort.
    fn pause_producing(&self, output: NodeId);

    /// Withdraw one prior pause from `output`.
    fn resume_producing(&self, output: NodeId);

    /// `output` will accept no more data; keep serving other outputs.
    fn stop_producing_output(&self, output: NodeId) {
        if self.core().stop_output(output) {
            self.stop_producing();
        }
    }

    /// Stop entirely: propagate upstream, idempotent, no-op after natural
    /// completion.
    fn stop_producing(&self);

    // ---- structural accessors ----

    /// Display label (non-unique; defaults to the kind name).
    fn label(&self) -> &str {
        self.core().label()
    }

    /// Ordered input nodes.
    fn inputs(&self) -> &[NodeId] {
        self.core().inputs()
    }

    /// Human-readable role label per input, aligned 1:1 with `inputs`.
    fn input_labels(&self) -> &[String] {
        self.core().input_labels()
    }

    /// Declared output arity (0 for sinks).
    fn num_outputs(&self) -> usize {
        self.core().num_outputs()
    }

    /// The batch shape this node guarantees downstream.
    fn output_schema(&self) -> SchemaRef {
        self.core().schema()
    }

    /// Future resolving when this node will emit no further data.
    fn finished(&self) -> CompletionFuture {
        self.core().finished()
    }
}

/// Whether a data-protocol call completed the node's input accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// More input outstanding (or totals not yet declared).
    Pending,
    /// Every input's declared total has been received. Reported exactly once.
    AllInputsDrained,
}

struct InputProgress {
    received: usize,
    total: Option<usize>,
}

struct Accounting {
    inputs: Vec<InputProgress>,
    all_reported: bool,
}

impl Accounting {
    fn drain_state(&mut self) -> DrainState {
        if self.all_reported {
            return DrainState::Pending;
        }
        let drained = self
            .inputs
            .iter()
            .all(|p| matches!(p.total, Some(t) if p.received >= t));
        if drained && !self.inputs.is_empty() {
            self.all_reported = true;
            DrainState::AllInputsDrained
        } else {
            DrainState::Pending
        }
    }
}

struct CoreInner {
    kind: &'static str,
    label: String,
    plan: Weak<PlanInner>,
    id: OnceLock<NodeId>,
    inputs: Vec<NodeId>,
    input_labels: Vec<String>,
    num_outputs: usize,
    schema: SchemaRef,
    outputs: Mutex<Vec<NodeId>>,
    stopped_outputs: Mutex<HashSet<NodeId>>,
    started: AtomicBool,
    stopped: AtomicBool,
    pause_count: AtomicUsize,
    finished: CompletionFuture,
    accounting: Mutex<Accounting>,
    metrics: MetricsRegistry,
}

/// Shared state block embedded by every node kind.
///
/// Cheap to clone (a handle); clones share the same state. Owns the pieces
/// every operator needs: edge lists, per-input drain accounting, the counted
/// pause state, the stop flag, and the completion future. All
/// neighbor-notifying helpers snapshot state under the lock, release it, and
/// only then call out.
#[derive(Clone)]
pub struct NodeCore {
    inner: Arc<CoreInner>,
}

impl NodeCore {
    /// Build the state block for a node with the given edges and schema.
    ///
    /// `label` defaults to `kind` when `None`. Input role labels default to
    /// `"input"`, or `"i{n}"` when there are several.
    pub fn new(
        plan: &ExecPlan,
        kind: &'static str,
        label: Option<String>,
        inputs: Vec<NodeId>,
        input_labels: Option<Vec<String>>,
        num_outputs: usize,
        schema: SchemaRef,
    ) -> Self {
        let input_labels = input_labels.unwrap_or_else(|| match inputs.len() {
            0 => Vec::new(),
            1 => vec!["input".to_string()],
            n => (0..n).map(|i| format!("i{i}")).collect(),
        });
        let accounting = Accounting {
            inputs: inputs
                .iter()
                .map(|_| InputProgress {
                    received: 0,
                    total: None,
                })
                .collect(),
            all_reported: false,
        };
        Self {
            inner: Arc::new(CoreInner {
                kind,
                label: label.unwrap_or_else(|| kind.to_string()),
                plan: plan.downgrade(),
                id: OnceLock::new(),
                inputs,
                input_labels,
                num_outputs,
                schema,
                outputs: Mutex::new(Vec::new()),
                stopped_outputs: Mutex::new(HashSet::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                pause_count: AtomicUsize::new(0),
                finished: CompletionFuture::pending(),
                accounting: Mutex::new(accounting),
                metrics: plan.context().metrics.clone(),
            }),
        }
    }

    // ---- structural accessors ----

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inner.inputs
    }

    pub fn input_labels(&self) -> &[String] {
        &self.inner.input_labels
    }

    pub fn num_outputs(&self) -> usize {
        self.inner.num_outputs
    }

    pub fn schema(&self) -> SchemaRef {
        self.inner.schema.clone()
    }

    /// Arena id; only available once the node has been added to its plan.
    pub fn id(&self) -> Option<NodeId> {
        self.inner.id.get().copied()
    }

    pub(crate) fn set_id(&self, id: NodeId) -> Result<()> {
        self.inner
            .id
            .set(id)
            .map_err(|_| BrookError::Graph("node added to a plan twice".to_string()))
    }

    pub(crate) fn plan_ptr(&self) -> &Weak<PlanInner> {
        &self.inner.plan
    }

    /// The owning plan, if it is still alive.
    pub fn plan(&self) -> Option<ExecPlan> {
        self.inner.plan.upgrade().map(ExecPlan::from_inner)
    }

    /// Wired downstream consumers (snapshot).
    pub fn outputs(&self) -> Vec<NodeId> {
        self.inner
            .outputs
            .lock()
            .expect("node outputs lock poisoned")
            .clone()
    }

    pub(crate) fn add_output(&self, id: NodeId) {
        self.inner
            .outputs
            .lock()
            .expect("node outputs lock poisoned")
            .push(id);
    }

    /// "kind(label)#id" for logs.
    pub fn describe(&self) -> String {
        match self.id() {
            Some(id) => format!("{}({})#{}", self.inner.kind, self.inner.label, id.0),
            None => format!("{}({})", self.inner.kind, self.inner.label),
        }
    }

    // ---- lifecycle flags ----

    /// First start wins; a second start is a precondition violation.
    pub fn mark_started(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "node started twice: {}", self.describe());
            return Err(BrookError::Graph(format!(
                "node started twice: {}",
                self.describe()
            )));
        }
        debug!(node = %self.describe(), "node starting");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Returns true the first time only.
    pub fn mark_stopped(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        if first {
            debug!(node = %self.describe(), "node stopping");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    // ---- counted pause state ----

    /// Returns true when this call paused a previously-unpaused node.
    pub fn increment_pause(&self) -> bool {
        self.inner.pause_count.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Returns true when this call resumed the node (count reached zero).
    /// Unbalanced resumes are ignored.
    pub fn decrement_pause(&self) -> bool {
        self.inner
            .pause_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause_count.load(Ordering::SeqCst) > 0
    }

    // ---- input accounting ----

    /// Position of `input` within this node's ordered inputs.
    pub fn input_index(&self, input: NodeId) -> Option<usize> {
        self.inner.inputs.iter().position(|i| *i == input)
    }

    /// Account one received batch on `input`. Must be called before the
    /// transformed batch is pushed downstream (state-then-notify).
    pub fn record_received(&self, input: NodeId) -> DrainState {
        let Some(idx) = self.input_index(input) else {
            debug_assert!(false, "batch from unknown input on {}", self.describe());
            return DrainState::Pending;
        };
        let mut acc = self
            .inner
            .accounting
            .lock()
            .expect("node accounting lock poisoned");
        acc.inputs[idx].received += 1;
        if let Some(total) = acc.inputs[idx].total {
            debug_assert!(
                acc.inputs[idx].received <= total,
                "more batches than declared on {}",
                self.describe()
            );
        }
        acc.drain_state()
    }

    /// Account an `input_finished(seq_stop)` declaration on `input`.
    pub fn record_finished(&self, input: NodeId, seq_stop: usize) -> DrainState {
        let Some(idx) = self.input_index(input) else {
            debug_assert!(false, "finish from unknown input on {}", self.describe());
            return DrainState::Pending;
        };
        let mut acc = self
            .inner
            .accounting
            .lock()
            .expect("node accounting lock poisoned");
        debug_assert!(
            acc.inputs[idx].total.is_none() || acc.inputs[idx].total == Some(seq_stop),
            "conflicting input_finished totals on {}",
            self.describe()
        );
        acc.inputs[idx].total = Some(seq_stop);
        acc.drain_state()
    }

    // ---- neighbor notification helpers (never hold locks while calling) ----

    fn live_outputs(&self) -> Vec<NodeId> {
        let outputs = self.outputs();
        let stopped = self
            .inner
            .stopped_outputs
            .lock()
            .expect("node stopped-outputs lock poisoned");
        outputs
            .into_iter()
            .filter(|id| !stopped.contains(id))
            .collect()
    }

    /// Record a stop for one output edge; true when every output is stopped.
    pub fn stop_output(&self, output: NodeId) -> bool {
        let outputs = self.outputs();
        let mut stopped = self
            .inner
            .stopped_outputs
            .lock()
            .expect("node stopped-outputs lock poisoned");
        stopped.insert(output);
        !outputs.is_empty() && outputs.iter().all(|id| stopped.contains(id))
    }

    /// Push one batch to every live output under `seq`.
    pub fn push_to_outputs(&self, seq: usize, batch: &RecordBatch) {
        let Some(plan) = self.inner.plan.upgrade() else {
            return;
        };
        let self_id = match self.id() {
            Some(id) => id,
            None => return,
        };
        let targets = self.live_outputs();
        if targets.is_empty() {
            return;
        }
        self.inner.metrics.record_node_output(
            self.inner.kind,
            &self.inner.label,
            (batch.num_rows() * targets.len()) as u64,
            targets.len() as u64,
        );
        for id in targets {
            if let Some(node) = plan.node(id) {
                node.input_received(self_id, seq, batch.clone());
            }
        }
    }

    /// Declare `input_finished(seq_stop)` to every live output.
    pub fn finish_outputs(&self, seq_stop: usize) {
        let Some(plan) = self.inner.plan.upgrade() else {
            return;
        };
        let self_id = match self.id() {
            Some(id) => id,
            None => return,
        };
        for id in self.live_outputs() {
            if let Some(node) = plan.node(id) {
                node.input_finished(self_id, seq_stop);
            }
        }
    }

    /// Forward an error to every live output.
    pub fn error_to_outputs(&self, error: &BrookError) {
        let Some(plan) = self.inner.plan.upgrade() else {
            return;
        };
        let self_id = match self.id() {
            Some(id) => id,
            None => return,
        };
        for id in self.live_outputs() {
            if let Some(node) = plan.node(id) {
                node.error_received(self_id, error.clone());
            }
        }
    }

    /// Error helper shared by every node kind: on `Err`, forward the error
    /// to all outputs, stop this node (including upstream propagation), fail
    /// the completion future, and return true so the caller early-returns.
    pub fn forward_error(&self, status: Result<()>) -> bool {
        let Err(error) = status else {
            return false;
        };
        warn!(node = %self.describe(), %error, "node failed; propagating to outputs");
        self.mark_stopped();
        self.error_to_outputs(&error);
        self.stop_inputs();
        self.mark_finished(Err(error));
        true
    }

    /// Forward a pause hint to every input.
    pub fn pause_inputs(&self) {
        self.for_each_input(|node, self_id| node.pause_producing(self_id));
    }

    /// Forward a resume hint to every input.
    pub fn resume_inputs(&self) {
        self.for_each_input(|node, self_id| node.resume_producing(self_id));
    }

    /// Propagate a full stop into every input.
    pub fn stop_inputs(&self) {
        self.for_each_input(|node, _| node.stop_producing());
    }

    fn for_each_input(&self, f: impl Fn(&Arc<dyn ExecNode>, NodeId)) {
        let Some(plan) = self.inner.plan.upgrade() else {
            return;
        };
        let self_id = match self.id() {
            Some(id) => id,
            None => return,
        };
        for id in &self.inner.inputs {
            if let Some(node) = plan.node(*id) {
                f(&node, self_id);
            }
        }
    }

    // ---- completion / metrics ----

    pub fn finished(&self) -> CompletionFuture {
        self.inner.finished.clone()
    }

    /// Resolve this node's future (first assignment wins).
    pub fn mark_finished(&self, result: Result<()>) {
        let status = if result.is_ok() { "ok" } else { "error" };
        if self.inner.finished.mark_finished(result) {
            self.inner
                .metrics
                .record_node_finished(self.inner.kind, &self.inner.label, status);
            debug!(node = %self.describe(), status, "node finished");
        }
    }

    /// Account one received batch in the metrics counters.
    pub fn record_input_metrics(&self, batch: &RecordBatch) {
        self.inner.metrics.record_node_input(
            self.inner.kind,
            &self.inner.label,
            batch.num_rows() as u64,
            1,
        );
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("node", &self.describe())
            .field("inputs", &self.inner.inputs)
            .field("outputs", &self.outputs())
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .field("paused", &self.is_paused())
            .finish()
    }
}
