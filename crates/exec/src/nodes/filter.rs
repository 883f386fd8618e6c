//! Row filtering against a compiled boolean predicate.

use std::sync::Arc;

use arrow::array::{Array, BooleanArray};
use arrow::compute::{filter_record_batch, prep_null_mask_filter};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use brook_common::{BrookError, Result};
use brook_expr::{Expr, PhysicalExpr, compile_expr};

use crate::node::{DrainState, ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;

/// Construction options for a [`FilterNode`].
pub struct FilterOptions {
    pub label: Option<String>,
    /// Boolean predicate evaluated per input row.
    pub predicate: Expr,
}

/// Stateless one-in one-out node keeping rows where the predicate is true.
///
/// Null predicate results drop the row. Output batches reuse the input's
/// sequence numbers, so empty results are still forwarded to keep downstream
/// accounting exact.
pub struct FilterNode {
    core: NodeCore,
    predicate: Arc<dyn PhysicalExpr>,
}

impl FilterNode {
    /// Compile `options.predicate` against the input's schema and add the
    /// node to `plan`. Non-boolean predicates are rejected here.
    pub fn make(plan: &ExecPlan, input: NodeId, options: FilterOptions) -> Result<NodeId> {
        let schema = plan.node(input)?.output_schema();
        let predicate = compile_expr(&options.predicate, &schema)?;
        if predicate.data_type() != DataType::Boolean {
            return Err(BrookError::Expression(format!(
                "filter predicate must be boolean, got {:?}: {}",
                predicate.data_type(),
                options.predicate
            )));
        }
        let core = NodeCore::new(plan, "filter", options.label, vec![input], None, 1, schema);
        let node = Arc::new(Self { core, predicate });
        plan.add_node(node)
    }

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let evaluated = self.predicate.evaluate(batch)?;
        let mask = evaluated
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| {
                BrookError::Expression("filter predicate did not evaluate to booleans".to_string())
            })?;
        let mask = if mask.null_count() > 0 {
            prep_null_mask_filter(mask)
        } else {
            mask.clone()
        };
        filter_record_batch(batch, &mask)
            .map_err(|e| BrookError::Execution(format!("filter kernel failed: {e}")))
    }
}

impl ExecNode for FilterNode {
    fn kind_name(&self) -> &'static str {
        "filter"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, input: NodeId, seq: usize, batch: RecordBatch) {
        if self.core.is_stopped() {
            return;
        }
        self.core.record_input_metrics(&batch);
        let filtered = match self.apply(&batch) {
            Ok(filtered) => filtered,
            Err(e) => {
                self.core.forward_error(Err(e));
                return;
            }
        };
        let drain = self.core.record_received(input);
        self.core.push_to_outputs(seq, &filtered);
        if drain == DrainState::AllInputsDrained {
            self.core.mark_stopped();
            self.core.mark_finished(Ok(()));
        }
    }

    fn error_received(&self, _input: NodeId, error: BrookError) {
        self.core.forward_error(Err(error));
    }

    fn input_finished(&self, input: NodeId, seq_stop: usize) {
        if self.core.is_stopped() {
            return;
        }
        let drain = self.core.record_finished(input, seq_stop);
        // One output batch per input batch, so the declared total carries over.
        self.core.finish_outputs(seq_stop);
        if drain == DrainState::AllInputsDrained {
            self.core.mark_stopped();
            self.core.mark_finished(Ok(()));
        }
    }

    fn start_producing(&self) -> Result<()> {
        self.core.mark_started()
    }

    fn pause_producing(&self, _output: NodeId) {
        if self.core.increment_pause() {
            self.core.pause_inputs();
        }
    }

    fn resume_producing(&self, _output: NodeId) {
        if self.core.decrement_pause() {
            self.core.resume_inputs();
        }
    }

    fn stop_producing(&self) {
        if self.core.mark_stopped() {
            self.core.stop_inputs();
            self.core.mark_finished(Ok(()));
        }
    }
}
