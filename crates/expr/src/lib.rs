//! Expression and aggregation collaborators for the brook execution core.
//!
//! Architecture role:
//! - serde-friendly expression trees handed to node constructors
//! - compilation of trees into batch-evaluable physical expressions
//! - incremental fold/finalize aggregation kernels for pipeline breakers
//!
//! Key modules:
//! - [`expr`]
//! - [`physical`]
//! - [`aggregate`]
//!
//! The execution core treats everything here as an opaque capability: filter
//! and project nodes only see [`PhysicalExpr`], aggregate nodes only see the
//! spec/state kernels.

pub mod aggregate;
pub mod expr;
pub mod physical;

pub use aggregate::{
    AggSpec, AggState, GroupEntry, GroupMap, ScalarValue, build_agg_specs, encode_group_key,
    finalize_state, init_states, scalar_from_array, scalars_to_array, update_state,
};
pub use expr::{AggExpr, BinaryOp, Expr, LiteralValue};
pub use physical::{PhysicalExpr, compile_expr};
