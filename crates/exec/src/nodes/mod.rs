//! Built-in node kinds.

pub mod aggregate;
pub mod filter;
pub mod group_by;
pub mod project;
pub mod sink;
pub mod source;

pub use aggregate::{AggregateOptions, ScalarAggregateNode};
pub use filter::{FilterNode, FilterOptions};
pub use group_by::{GroupByNode, GroupByOptions};
pub use project::{ProjectNode, ProjectOptions};
pub use sink::{SinkNode, SinkOptions};
pub use source::{SourceNode, SourceOptions};
