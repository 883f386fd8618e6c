//! Column projection: rebuilds each batch from compiled expressions.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use brook_common::{BrookError, Result};
use brook_expr::{Expr, PhysicalExpr, compile_expr};

use crate::node::{DrainState, ExecNode, NodeCore, NodeId};
use crate::plan::ExecPlan;

/// Construction options for a [`ProjectNode`].
///
/// Each entry is one output column; a missing name defaults to the
/// expression's display form (`price * qty`).
pub struct ProjectOptions {
    pub label: Option<String>,
    pub exprs: Vec<(Expr, Option<String>)>,
}

/// Stateless one-in one-out node computing one output column per expression.
pub struct ProjectNode {
    core: NodeCore,
    exprs: Vec<Arc<dyn PhysicalExpr>>,
    schema: SchemaRef,
}

impl ProjectNode {
    /// Compile the expressions against the input's schema and add the node
    /// to `plan`. At least one expression is required.
    pub fn make(plan: &ExecPlan, input: NodeId, options: ProjectOptions) -> Result<NodeId> {
        if options.exprs.is_empty() {
            return Err(BrookError::InvalidConfig(
                "project node needs at least one expression".to_string(),
            ));
        }
        let input_schema = plan.node(input)?.output_schema();
        let mut compiled = Vec::with_capacity(options.exprs.len());
        let mut fields = Vec::with_capacity(options.exprs.len());
        for (expr, name) in &options.exprs {
            let physical = compile_expr(expr, &input_schema)?;
            let name = name.clone().unwrap_or_else(|| expr.to_string());
            fields.push(Field::new(name, physical.data_type(), true));
            compiled.push(physical);
        }
        let schema: SchemaRef = Arc::new(Schema::new(fields));
        let core = NodeCore::new(
            plan,
            "project",
            options.label,
            vec![input],
            None,
            1,
            schema.clone(),
        );
        let node = Arc::new(Self {
            core,
            exprs: compiled,
            schema,
        });
        plan.add_node(node)
    }

    fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let columns = self
            .exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        RecordBatch::try_new(self.schema.clone(), columns)
            .map_err(|e| BrookError::Execution(format!("project failed to build batch: {e}")))
    }
}

impl ExecNode for ProjectNode {
    fn kind_name(&self) -> &'static str {
        "project"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, input: NodeId, seq: usize, batch: RecordBatch) {
        if self.core.is_stopped() {
            return;
        }
        self.core.record_input_metrics(&batch);
        let projected = match self.apply(&batch) {
            Ok(projected) => projected,
            Err(e) => {
                self.core.forward_error(Err(e));
                return;
            }
        };
        let drain = self.core.record_received(input);
        self.core.push_to_outputs(seq, &projected);
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
