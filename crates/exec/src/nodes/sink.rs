//! Exit point of a graph: queues pushed batches behind a consumer stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use brook_common::{BrookError, Result};
use tracing::debug;

use crate::node::{DrainState, ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;
use crate::stream::{BatchQueue, SendableRecordBatchStream};

/// Construction options for a [`SinkNode`].
///
/// The registry factory cannot return a stream alongside the node id, so the
/// consumer stream is delivered through the `output` slot instead; callers
/// using [`SinkNode::make`] directly receive the stream as a return value
/// and can pass a throwaway slot.
pub struct SinkOptions {
    pub label: Option<String>,
    /// Filled with the consumer-side stream during construction.
    pub output: Arc<Mutex<Option<SendableRecordBatchStream>>>,
}

/// Consumer node exposing its input as a [`SendableRecordBatchStream`].
///
/// Batches are queued in arrival order; sequence numbers only feed drain
/// accounting. The queue is unbounded, with counted pause/resume hints sent
/// upstream when its depth crosses the context's watermarks.
pub struct SinkNode {
    core: NodeCore,
    queue: BatchQueue,
    input_paused: Arc<AtomicBool>,
    pause_watermark: usize,
    resume_watermark: usize,
}

impl SinkNode {
    /// Build a sink over `input` and add it to `plan`, returning the node id
    /// and the stream that drains it.
    pub fn make(
        plan: &ExecPlan,
        input: NodeId,
        label: Option<String>,
    ) -> Result<(NodeId, SendableRecordBatchStream)> {
        let schema = plan.node(input)?.output_schema();
        let core = NodeCore::new(plan, "sink", label, vec![input], None, 0, schema.clone());
        let (queue, stream) = BatchQueue::new(schema);
        let node = Arc::new(Self {
            core,
            queue,
            input_paused: Arc::new(AtomicBool::new(false)),
            pause_watermark: plan.context().sink_pause_watermark,
            resume_watermark: plan.context().sink_resume_watermark,
        });
        let id = plan.add_node(node)?;
        Ok((id, stream))
    }

    /// Registry-factory variant of [`SinkNode::make`].
    pub fn make_with_options(
        plan: &ExecPlan,
        input: NodeId,
        options: SinkOptions,
    ) -> Result<NodeId> {
        let (id, stream) = Self::make(plan, input, options.label)?;
        *options.output.lock().expect("sink output slot poisoned") = Some(stream);
        Ok(id)
    }

    fn finish(&self) {
        debug!(node = %self.core.describe(), "sink input drained");
        self.queue.close();
        self.core.mark_stopped();
        self.core.mark_finished(Ok(()));
    }

    fn check_pause(&self, depth: usize) {
        if depth >= self.pause_watermark
            && self
                .input_paused
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            debug!(node = %self.core.describe(), depth, "sink backlog high; pausing input");
            self.core.pause_inputs();
        }
    }
}

impl ExecNode for SinkNode {
    fn kind_name(&self) -> &'static str {
        "sink"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, input: NodeId, _seq: usize, batch: RecordBatch) {
        if self.core.is_stopped() {
            return;
        }
        self.core.record_input_metrics(&batch);
        let drain = self.core.record_received(input);
        let depth = self.queue.push(Ok(batch));
        if drain == DrainState::AllInputsDrained {
            self.finish();
        } else {
            self.check_pause(depth);
        }
    }

    fn error_received(&self, _input: NodeId, error: BrookError) {
        self.queue.push(Err(error.clone()));
        self.queue.close();
        self.core.forward_error(Err(error));
    }

    fn input_finished(&self, input: NodeId, seq_stop: usize) {
        if self.core.is_stopped() {
            return;
        }
        if self.core.record_finished(input, seq_stop) == DrainState::AllInputsDrained {
            self.finish();
        }
    }

    fn start_producing(&self) -> Result<()> {
        self.core.mark_started()?;
        // The drain hook runs on the consumer's poll thread.
        let core = self.core.clone();
        let input_paused = self.input_paused.clone();
        let resume_watermark = self.resume_watermark;
        self.queue.set_drain_hook(Arc::new(move |depth| {
            if depth <= resume_watermark
                && input_paused
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                debug!(node = %core.describe(), depth, "sink backlog drained; resuming input");
                core.resume_inputs();
            }
        }));
        Ok(())
    }

    fn pause_producing(&self, _output: NodeId) {
        debug_assert!(false, "sink node has no outputs");
    }

    fn resume_producing(&self, _output: NodeId) {
        debug_assert!(false, "sink node has no outputs");
    }

    fn stop_producing(&self) {
        if self.core.mark_stopped() {
            self.queue.close();
            self.core.stop_inputs();
            self.core.mark_finished(Ok(()));
        }
    }
}
