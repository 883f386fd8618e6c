//! Whole-input scalar aggregation (pipeline breaker).

use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use brook_common::{BrookError, MemoryReservation, Result};
use brook_expr::{
    AggExpr, AggSpec, AggState, PhysicalExpr, build_agg_specs, compile_expr, finalize_state,
    init_states, scalar_from_array, scalars_to_array, update_state,
};
use tracing::debug;

use crate::node::{DrainState, ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;

/// Construction options for a [`ScalarAggregateNode`].
pub struct AggregateOptions {
    pub label: Option<String>,
    /// Aggregates with optional output column names.
    pub aggregates: Vec<(AggExpr, Option<String>)>,
}

struct AggAccum {
    states: Vec<AggState>,
    reservation: MemoryReservation,
    reserved_bytes: usize,
}

/// Pipeline breaker folding every input row into one output row.
///
/// Consumes its whole input before emitting exactly one batch at sequence 0
/// followed by `input_finished(1)`. Empty input still produces one row of
/// identity values (count 0, null min/max).
pub struct ScalarAggregateNode {
    core: NodeCore,
    specs: Vec<AggSpec>,
    value_exprs: Vec<Arc<dyn PhysicalExpr>>,
    accum: Mutex<AggAccum>,
}

impl ScalarAggregateNode {
    /// Resolve the aggregates against the input's schema and add the node
    /// to `plan`.
    pub fn make(plan: &ExecPlan, input: NodeId, options: AggregateOptions) -> Result<NodeId> {
        if options.aggregates.is_empty() {
            return Err(BrookError::InvalidConfig(
                "scalar aggregate node needs at least one aggregate".to_string(),
            ));
        }
        let input_schema = plan.node(input)?.output_schema();
        let specs = build_agg_specs(&options.aggregates, &input_schema)?;
        let value_exprs = specs
            .iter()
            .map(|s| compile_expr(s.expr.input(), &input_schema))
            .collect::<Result<Vec<_>>>()?;
        let fields: Vec<Field> = specs
            .iter()
            .map(|s| Field::new(s.name.clone(), s.out_type.clone(), true))
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let states = init_states(&specs);
        let reservation = plan.context().memory.reserve(64);
        let core = NodeCore::new(
            plan,
            "scalar_aggregate",
            options.label,
            vec![input],
            None,
            1,
            schema,
        );
        let node = Arc::new(Self {
            core,
            specs,
            value_exprs,
            accum: Mutex::new(AggAccum {
                states,
                reservation,
                reserved_bytes: 64,
            }),
        });
        plan.add_node(node)
    }

    fn fold(&self, batch: &RecordBatch) -> Result<()> {
        // Evaluate outside the accumulator lock; only the fold holds it.
        let columns = self
            .value_exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        let mut accum = self.accum.lock().expect("aggregate state lock poisoned");
        for row in 0..batch.num_rows() {
            for (state, column) in accum.states.iter_mut().zip(&columns) {
                update_state(state, scalar_from_array(column, row)?)?;
            }
        }
        let in_use: usize = accum.states.iter().map(AggState::estimate_bytes).sum();
        if in_use > accum.reserved_bytes {
            let additional = in_use - accum.reserved_bytes;
            accum.reservation.grow(additional);
            accum.reserved_bytes = in_use;
        }
        Ok(())
    }

    fn finalize_and_emit(&self) {
        let result = self.build_output();
        match result {
            Ok(batch) => {
                debug!(node = %self.core.describe(), "aggregate input drained; emitting");
                self.core.push_to_outputs(0, &batch);
                self.core.finish_outputs(1);
                self.core.mark_stopped();
                self.core.mark_finished(Ok(()));
            }
            Err(e) => {
                self.core.forward_error(Err(e));
            }
        }
    }

    fn build_output(&self) -> Result<RecordBatch> {
        let accum = self.accum.lock().expect("aggregate state lock poisoned");
        let columns = accum
            .states
            .iter()
            .zip(&self.specs)
            .map(|(state, spec)| scalars_to_array(&[finalize_state(state)], &spec.out_type))
            .collect::<Result<Vec<_>>>()?;
        RecordBatch::try_new(self.core.schema(), columns)
            .map_err(|e| BrookError::Execution(format!("aggregate failed to build batch: {e}")))
    }
}

impl ExecNode for ScalarAggregateNode {
    fn kind_name(&self) -> &'static str {
        "scalar_aggregate"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, input: NodeId, _seq: usize, batch: RecordBatch) {
        if self.core.is_stopped() {
            return;
        }
        self.core.record_input_metrics(&batch);
        if let Err(e) = self.fold(&batch) {
            self.core.forward_error(Err(e));
            return;
        }
        if self.core.record_received(input) == DrainState::AllInputsDrained {
            self.finalize_and_emit();
        }
    }

    fn error_received(&self, _input: NodeId, error: BrookError) {
        self.core.forward_error(Err(error));
    }

    fn input_finished(&self, input: NodeId, seq_stop: usize) {
        if self.core.is_stopped() {
            return;
        }
        if self.core.record_finished(input, seq_stop) == DrainState::AllInputsDrained {
            self.finalize_and_emit();
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
