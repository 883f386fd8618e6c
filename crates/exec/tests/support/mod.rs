#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use brook_common::{BrookError, Result};
use brook_exec::{ExecNode, ExecPlan, NodeCore, NodeId};

pub fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]))
}

pub fn int_batch(values: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(int_schema(), vec![Arc::new(Int64Array::from(values))])
        .expect("build int batch")
}

pub fn kv_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

pub fn kv_batch(pairs: Vec<(&str, i64)>) -> RecordBatch {
    let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
    let values: Vec<i64> = pairs.iter().map(|(_, v)| *v).collect();
    RecordBatch::try_new(
        kv_schema(),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .expect("build kv batch")
}

pub fn int_column(batch: &RecordBatch, name: &str) -> Vec<i64> {
    let idx = batch.schema().index_of(name).expect("column present");
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..array.len()).map(|i| array.value(i)).collect()
}

pub fn string_column(batch: &RecordBatch, name: &str) -> Vec<String> {
    let idx = batch.schema().index_of(name).expect("column present");
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column");
    (0..array.len()).map(|i| array.value(i).to_string()).collect()
}

/// Producer that never pushes on its own; tests drive its consumers by
/// calling their data-protocol methods directly with this node's id.
pub struct StubSource {
    core: NodeCore,
}

impl StubSource {
    pub fn make(plan: &ExecPlan, schema: SchemaRef) -> Result<NodeId> {
        let core = NodeCore::new(plan, "stub_source", None, Vec::new(), None, 1, schema);
        plan.add_node(Arc::new(Self { core }))
    }
}

impl ExecNode for StubSource {
    fn kind_name(&self) -> &'static str {
        "stub_source"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, _input: NodeId, _seq: usize, _batch: RecordBatch) {}

    fn error_received(&self, _input: NodeId, _error: BrookError) {}

    fn input_finished(&self, _input: NodeId, _seq_stop: usize) {}

    fn start_producing(&self) -> Result<()> {
        self.core.mark_started()
    }

    fn pause_producing(&self, _output: NodeId) {
        self.core.increment_pause();
    }

    fn resume_producing(&self, _output: NodeId) {
        self.core.decrement_pause();
    }

    fn stop_producing(&self) {
        if self.core.mark_stopped() {
            self.core.mark_finished(Ok(()));
        }
    }
}

/// Inert node that appends its label to a shared log when started.
pub struct ProbeNode {
    core: NodeCore,
    log: Arc<Mutex<Vec<String>>>,
}

impl ProbeNode {
    pub fn make(
        plan: &ExecPlan,
        label: &str,
        inputs: Vec<NodeId>,
        num_outputs: usize,
        schema: SchemaRef,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Result<NodeId> {
        let core = NodeCore::new(
            plan,
            "probe",
            Some(label.to_string()),
            inputs,
            None,
            num_outputs,
            schema,
        );
        plan.add_node(Arc::new(Self { core, log }))
    }
}

impl ExecNode for ProbeNode {
    fn kind_name(&self) -> &'static str {
        "probe"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn input_received(&self, _input: NodeId, _seq: usize, _batch: RecordBatch) {}

    fn error_received(&self, _input: NodeId, _error: BrookError) {}

    fn input_finished(&self, _input: NodeId, _seq_stop: usize) {}

    fn start_producing(&self) -> Result<()> {
        self.core.mark_started()?;
        self.log
            .lock()
            .expect("probe log lock poisoned")
            .push(self.label().to_string());
        Ok(())
    }

    fn pause_producing(&self, _output: NodeId) {
        self.core.increment_pause();
    }

    fn resume_producing(&self, _output: NodeId) {
        self.core.decrement_pause();
    }

    fn stop_producing(&self) {
        if self.core.mark_stopped() {
            self.core.stop_inputs();
            self.core.mark_finished(Ok(()));
        }
    }
}
