use std::sync::{Arc, Mutex};

use futures::StreamExt;

use brook_common::BrookError;
use brook_exec::nodes::{FilterOptions, SinkOptions, SourceOptions};
use brook_exec::{ExecContext, ExecPlan, batches_stream, default_registry};
use brook_expr::{BinaryOp, Expr, LiteralValue};

mod support;

use support::{int_batch, int_column, int_schema};

#[test]
fn registry_builds_a_working_pipeline() {
    let registry = default_registry();
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");

    let source = registry
        .make_exec_node(
            "source",
            &plan,
            &[],
            Box::new(SourceOptions {
                label: Some("numbers".to_string()),
                stream: batches_stream(int_schema(), vec![int_batch(vec![1, 2, 3, 4])]),
            }),
        )
        .expect("source");
    let filter = registry
        .make_exec_node(
            "filter",
            &plan,
            &[source],
            Box::new(FilterOptions {
                label: None,
                predicate: Expr::col("x")
                    .binary(BinaryOp::GtEq, Expr::lit(LiteralValue::Int64(3))),
            }),
        )
        .expect("filter");

    let slot = Arc::new(Mutex::new(None));
    registry
        .make_exec_node(
            "sink",
            &plan,
            &[filter],
            Box::new(SinkOptions {
                label: None,
                output: slot.clone(),
            }),
        )
        .expect("sink");
    let mut out = slot
        .lock()
        .expect("slot lock")
        .take()
        .expect("sink stream delivered");

    plan.start_producing().expect("start");
    let batch = futures::executor::block_on(out.next())
        .expect("one batch")
        .expect("ok batch");
    assert_eq!(int_column(&batch, "x"), vec![3, 4]);
    assert!(futures::executor::block_on(out.next()).is_none());
}

#[test]
fn wrong_option_type_is_rejected() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = default_registry()
        .make_exec_node(
            "source",
            &plan,
            &[],
            Box::new(SourceOptions {
                label: None,
                stream: batches_stream(int_schema(), Vec::new()),
            }),
        )
        .expect("source");

    let err = default_registry()
        .make_exec_node("filter", &plan, &[source], Box::new(42_u32))
        .expect_err("mismatched options");
    assert!(matches!(err, BrookError::InvalidConfig(_)), "got {err:?}");
}

#[test]
fn wrong_input_arity_is_rejected() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let err = default_registry()
        .make_exec_node(
            "filter",
            &plan,
            &[],
            Box::new(FilterOptions {
                label: None,
                predicate: Expr::lit(LiteralValue::Boolean(true)),
            }),
        )
        .expect_err("filter needs one input");
    assert!(matches!(err, BrookError::Graph(_)), "got {err:?}");
}

#[test]
fn unknown_kind_is_reported() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let err = default_registry()
        .make_exec_node("window", &plan, &[], Box::new(()))
        .expect_err("not registered");
    assert!(matches!(err, BrookError::FactoryNotFound(name) if name == "window"));
}
