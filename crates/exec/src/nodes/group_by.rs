//! Hash grouping with per-group aggregates (pipeline breaker).

use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use brook_common::{BrookError, MemoryReservation, Result};
use brook_expr::{
    AggExpr, AggSpec, Expr, GroupEntry, GroupMap, PhysicalExpr, build_agg_specs, compile_expr,
    encode_group_key, finalize_state, init_states, scalar_from_array, scalars_to_array,
    update_state,
};
use tracing::debug;

use crate::node::{DrainState, ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;

/// Construction options for a [`GroupByNode`].
///
/// Missing output names default to the expression's display form.
pub struct GroupByOptions {
    pub label: Option<String>,
    /// Grouping key expressions; rows with equal key tuples share a group.
    pub keys: Vec<(Expr, Option<String>)>,
    /// Per-group aggregates.
    pub aggregates: Vec<(AggExpr, Option<String>)>,
}

struct GroupAccum {
    map: GroupMap,
    reservation: MemoryReservation,
    reserved_bytes: usize,
}

/// Pipeline breaker building a hash map of group key to accumulator states.
///
/// Output schema is the key columns followed by the aggregate columns. Like
/// every breaker it emits one batch at sequence 0 then `input_finished(1)`;
/// empty input emits a zero-row batch. Group output order is unspecified.
pub struct GroupByNode {
    core: NodeCore,
    key_exprs: Vec<Arc<dyn PhysicalExpr>>,
    specs: Vec<AggSpec>,
    value_exprs: Vec<Arc<dyn PhysicalExpr>>,
    accum: Mutex<GroupAccum>,
}

impl GroupByNode {
    /// Resolve keys and aggregates against the input's schema and add the
    /// node to `plan`. Keyless grouping belongs to the scalar aggregate node.
    pub fn make(plan: &ExecPlan, input: NodeId, options: GroupByOptions) -> Result<NodeId> {
        if options.keys.is_empty() {
            return Err(BrookError::InvalidConfig(
                "group-by node needs at least one key (use scalar_aggregate for none)".to_string(),
            ));
        }
        if options.aggregates.is_empty() {
            return Err(BrookError::InvalidConfig(
                "group-by node needs at least one aggregate".to_string(),
            ));
        }
        let input_schema = plan.node(input)?.output_schema();
        let mut key_exprs = Vec::with_capacity(options.keys.len());
        let mut fields = Vec::with_capacity(options.keys.len() + options.aggregates.len());
        for (expr, name) in &options.keys {
            let physical = compile_expr(expr, &input_schema)?;
            let name = name.clone().unwrap_or_else(|| expr.to_string());
            fields.push(Field::new(name, physical.data_type(), true));
            key_exprs.push(physical);
        }
        let specs = build_agg_specs(&options.aggregates, &input_schema)?;
        let value_exprs = specs
            .iter()
            .map(|s| compile_expr(s.expr.input(), &input_schema))
            .collect::<Result<Vec<_>>>()?;
        for spec in &specs {
            fields.push(Field::new(spec.name.clone(), spec.out_type.clone(), true));
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let reservation = plan.context().memory.reserve(1024);
        let core = NodeCore::new(
            plan,
            "group_by",
            options.label,
            vec![input],
            None,
            1,
            schema,
        );
        let node = Arc::new(Self {
            core,
            key_exprs,
            specs,
            value_exprs,
            accum: Mutex::new(GroupAccum {
                map: GroupMap::new(),
                reservation,
                reserved_bytes: 1024,
            }),
        });
        plan.add_node(node)
    }

    fn fold(&self, batch: &RecordBatch) -> Result<()> {
        let key_columns = self
            .key_exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        let value_columns = self
            .value_exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        let mut accum = self.accum.lock().expect("group state lock poisoned");
        let mut added_bytes = 0usize;
        for row in 0..batch.num_rows() {
            let key: Vec<_> = key_columns
                .iter()
                .map(|c| scalar_from_array(c, row))
                .collect::<Result<_>>()?;
            let encoded = encode_group_key(&key);
            let entry = accum.map.entry(encoded).or_insert_with(|| {
                added_bytes += key.iter().map(|k| k.estimate_bytes()).sum::<usize>() + 64;
                GroupEntry {
                    key: key.clone(),
                    states: init_states(&self.specs),
                }
            });
            for (state, column) in entry.states.iter_mut().zip(&value_columns) {
                update_state(state, scalar_from_array(column, row)?)?;
            }
        }
        if added_bytes > 0 {
            accum.reservation.grow(added_bytes);
            accum.reserved_bytes += added_bytes;
        }
        Ok(())
    }

    fn finalize_and_emit(&self) {
        match self.build_output() {
            Ok(batch) => {
                debug!(
                    node = %self.core.describe(),
                    groups = batch.num_rows(),
                    "group-by input drained; emitting"
                );
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
        let accum = self.accum.lock().expect("group state lock poisoned");
        let entries: Vec<&GroupEntry> = accum.map.values().collect();
        let schema = self.core.schema();
        let mut columns = Vec::with_capacity(schema.fields().len());
        for (i, field) in schema.fields().iter().enumerate() {
            let values: Vec<_> = if i < self.key_exprs.len() {
                entries.iter().map(|e| e.key[i].clone()).collect()
            } else {
                let agg = i - self.key_exprs.len();
                entries
                    .iter()
                    .map(|e| finalize_state(&e.states[agg]))
                    .collect()
            };
            columns.push(scalars_to_array(&values, field.data_type())?);
        }
        RecordBatch::try_new(schema, columns)
            .map_err(|e| BrookError::Execution(format!("group-by failed to build batch: {e}")))
    }
}

impl ExecNode for GroupByNode {
    fn kind_name(&self) -> &'static str {
        "group_by"
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
