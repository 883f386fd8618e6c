//! Push-based streaming execution engine for Arrow record batches.
//!
//! A query runs as an [`ExecPlan`]: a DAG of [`ExecNode`] operators through
//! which producers push batches into consumers. Data flows downstream
//! (`input_received` / `error_received` / `input_finished`), control flows
//! upstream (`start` / `pause` / `resume` / `stop`), and completion is
//! observed through per-node and per-plan [`CompletionFuture`]s rather than
//! join handles, so the engine itself never requires an executor.
//!
//! Architecture role:
//! - [`plan`] owns the node arena and drives global lifecycle
//! - [`node`] defines the operator contract and the shared state core
//! - [`nodes`] provides the built-in operators (source, sink, filter,
//!   project, scalar aggregate, group-by)
//! - [`registry`] maps kind names to node factories for declarative builds
//! - [`stream`] carries batches across the graph boundary at both ends
//!
//! ```no_run
//! use std::sync::Arc;
//! use arrow::array::Int64Array;
//! use arrow::record_batch::RecordBatch;
//! use arrow_schema::{DataType, Field, Schema};
//! use brook_expr::{BinaryOp, Expr, LiteralValue};
//! use brook_exec::{ExecContext, ExecPlan, batches_stream};
//! use brook_exec::nodes::{FilterNode, FilterOptions, SinkNode, SourceNode, SourceOptions};
//!
//! # fn main() -> brook_common::Result<()> {
//! let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
//! let batch = RecordBatch::try_new(
//!     schema.clone(),
//!     vec![Arc::new(Int64Array::from(vec![1, 5, 9]))],
//! ).unwrap();
//!
//! let plan = ExecPlan::try_new(ExecContext::default())?;
//! let source = SourceNode::make(&plan, SourceOptions {
//!     label: None,
//!     stream: batches_stream(schema, vec![batch]),
//! })?;
//! let filter = FilterNode::make(&plan, source, FilterOptions {
//!     label: None,
//!     predicate: Expr::col("x").binary(BinaryOp::Gt, Expr::lit(LiteralValue::Int64(3))),
//! })?;
//! let (_sink, _out) = SinkNode::make(&plan, filter, None)?;
//! plan.start_producing()?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod future;
pub mod node;
pub mod nodes;
pub mod plan;
pub mod registry;
pub mod stream;

pub use context::{ExecContext, SharedExecContext};
pub use future::CompletionFuture;
pub use node::{DrainState, ExecNode, NodeCore, NodeId};
pub use plan::ExecPlan;
pub use registry::{NodeFactory, NodeRegistry, default_registry};
pub use stream::{
    BatchQueue, RecordBatchStream, SendableRecordBatchStream, StreamAdapter, batches_stream,
    empty_stream,
};
