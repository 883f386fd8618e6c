//! Entry point of a graph: pulls a batch stream and pushes it downstream.

use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use brook_common::{BrookError, Result};
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::node::{ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;
use crate::stream::SendableRecordBatchStream;

/// Construction options for a [`SourceNode`].
pub struct SourceOptions {
    pub label: Option<String>,
    /// The batch generator this node drains.
    pub stream: SendableRecordBatchStream,
}

/// Producer node wrapping a [`SendableRecordBatchStream`].
///
/// `start_producing` hands the stream to a pull loop: spawned on the
/// context's runtime when one is present, driven to completion on the
/// calling thread otherwise (safe because the plan starts consumers first).
/// The loop assigns sequence numbers in pull order and declares
/// `input_finished` with the final count when the stream ends. Between pulls
/// it parks on the counted pause state, except in the no-runtime fallback,
/// where the loop holds the only thread that could drain downstream and a
/// paused wait could never be resumed.
pub struct SourceNode {
    core: NodeCore,
    stream: Mutex<Option<SendableRecordBatchStream>>,
    resume: Arc<Notify>,
}

impl SourceNode {
    /// Build a source around `options.stream` and add it to `plan`.
    pub fn make(plan: &ExecPlan, options: SourceOptions) -> Result<NodeId> {
        let schema = options.stream.schema();
        let core = NodeCore::new(plan, "source", options.label, Vec::new(), None, 1, schema);
        let node = Arc::new(Self {
            core,
            stream: Mutex::new(Some(options.stream)),
            resume: Arc::new(Notify::new()),
        });
        plan.add_node(node)
    }
}

async fn pull_loop(
    core: NodeCore,
    resume: Arc<Notify>,
    mut stream: SendableRecordBatchStream,
    honor_pause: bool,
) {
    let mut seq = 0usize;
    loop {
        if core.is_stopped() {
            break;
        }
        // notify_one stores a permit, so a resume (or stop) landing between
        // the check and the await still wakes this loop. Without a runtime
        // the loop owns the only thread that could drain downstream and
        // resume it, so pause hints are ignored there (pause is best-effort).
        while honor_pause && core.is_paused() && !core.is_stopped() {
            resume.notified().await;
        }
        if core.is_stopped() {
            break;
        }
        match stream.next().await {
            Some(Ok(batch)) => {
                core.push_to_outputs(seq, &batch);
                seq += 1;
            }
            Some(Err(e)) => {
                core.forward_error(Err(e));
                return;
            }
            None => break,
        }
    }
    debug!(node = %core.describe(), batches = seq, "source drained");
    core.finish_outputs(seq);
    core.mark_stopped();
    core.mark_finished(Ok(()));
}

impl ExecNode for SourceNode {
    fn kind_name(&self) -> &'static str {
        "source"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, _input: NodeId, _seq: usize, _batch: RecordBatch) {
        debug_assert!(false, "source node has no inputs");
    }

    fn error_received(&self, _input: NodeId, _error: BrookError) {
        debug_assert!(false, "source node has no inputs");
    }

    fn input_finished(&self, _input: NodeId, _seq_stop: usize) {
        debug_assert!(false, "source node has no inputs");
    }

    fn start_producing(&self) -> Result<()> {
        self.core.mark_started()?;
        let stream = self
            .stream
            .lock()
            .expect("source stream lock poisoned")
            .take()
            .ok_or_else(|| {
                BrookError::Execution(format!("source stream already consumed: {}", self.label()))
            })?;
        let core = self.core.clone();
        let resume = self.resume.clone();
        let runtime = self
            .core
            .plan()
            .and_then(|plan| plan.context().runtime.clone());
        match runtime {
            Some(handle) => {
                handle.spawn(pull_loop(core, resume, stream, true));
            }
            None => futures::executor::block_on(pull_loop(core, resume, stream, false)),
        }
        Ok(())
    }

    fn pause_producing(&self, _output: NodeId) {
        self.core.increment_pause();
    }

    fn resume_producing(&self, _output: NodeId) {
        if self.core.decrement_pause() {
            self.resume.notify_one();
        }
    }

    fn stop_producing(&self) {
        if self.core.mark_stopped() {
            // Wake a parked pull loop so it observes the stop flag.
            self.resume.notify_one();
            if !self.core.is_started() {
                self.core.mark_finished(Ok(()));
            }
        }
    }
}
