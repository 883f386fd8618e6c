use futures::FutureExt;
use futures::StreamExt;

use arrow::record_batch::RecordBatch;
use brook_common::Result;
use brook_exec::nodes::{
    AggregateOptions, FilterNode, FilterOptions, GroupByNode, GroupByOptions, ProjectNode,
    ProjectOptions, ScalarAggregateNode, SinkNode, SourceNode, SourceOptions,
};
use brook_exec::{ExecContext, ExecPlan, SendableRecordBatchStream, batches_stream, empty_stream};
use brook_expr::{AggExpr, BinaryOp, Expr, LiteralValue};

mod support;

use support::{StubSource, int_batch, int_column, int_schema, kv_batch, kv_schema, string_column};

fn collect(mut stream: SendableRecordBatchStream) -> Vec<Result<RecordBatch>> {
    futures::executor::block_on(async {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    })
}

#[test]
fn filter_keeps_matching_rows() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: batches_stream(int_schema(), vec![int_batch(vec![1, 2, 3, 4, 5])]),
        },
    )
    .expect("source");
    let filter = FilterNode::make(
        &plan,
        source,
        FilterOptions {
            label: None,
            predicate: Expr::col("x").binary(BinaryOp::Gt, Expr::lit(LiteralValue::Int64(2))),
        },
    )
    .expect("filter");
    let (_sink, out) = SinkNode::make(&plan, filter, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    assert_eq!(batches.len(), 1);
    let batch = batches[0].as_ref().expect("batch");
    assert_eq!(int_column(batch, "x"), vec![3, 4, 5]);
    assert!(matches!(plan.finished().peek(), Some(Ok(()))));
}

#[test]
fn filter_forwards_empty_batches() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: batches_stream(int_schema(), vec![int_batch(vec![1, 2])]),
        },
    )
    .expect("source");
    let filter = FilterNode::make(
        &plan,
        source,
        FilterOptions {
            label: None,
            predicate: Expr::col("x").binary(BinaryOp::Gt, Expr::lit(LiteralValue::Int64(100))),
        },
    )
    .expect("filter");
    let (_sink, out) = SinkNode::make(&plan, filter, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    // The batch survives with zero rows so downstream accounting stays exact.
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].as_ref().expect("batch").num_rows(), 0);
}

#[test]
fn project_computes_derived_columns() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: batches_stream(
                kv_schema(),
                vec![kv_batch(vec![("a", 10), ("b", 20)])],
            ),
        },
    )
    .expect("source");
    let project = ProjectNode::make(
        &plan,
        source,
        ProjectOptions {
            label: None,
            exprs: vec![
                (Expr::col("k"), None),
                (
                    Expr::col("v").binary(BinaryOp::Multiply, Expr::lit(LiteralValue::Int64(2))),
                    Some("double_v".to_string()),
                ),
            ],
        },
    )
    .expect("project");
    let (_sink, out) = SinkNode::make(&plan, project, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    assert_eq!(batches.len(), 1);
    let batch = batches[0].as_ref().expect("batch");
    assert_eq!(string_column(batch, "k"), vec!["a", "b"]);
    assert_eq!(int_column(batch, "double_v"), vec![20, 40]);
}

#[test]
fn aggregate_emits_once_despite_out_of_order_delivery() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let stub = StubSource::make(&plan, int_schema()).expect("stub");
    let agg = ScalarAggregateNode::make(
        &plan,
        stub,
        AggregateOptions {
            label: None,
            aggregates: vec![
                (AggExpr::Count(Expr::col("x")), Some("cnt".to_string())),
                (AggExpr::Sum(Expr::col("x")), Some("total".to_string())),
            ],
        },
    )
    .expect("aggregate");
    let (_sink, mut out) = SinkNode::make(&plan, agg, None).expect("sink");
    plan.start_producing().expect("start");

    let agg_node = plan.node(agg).expect("agg node");

    // Sequence numbers arrive shuffled, with the total declared mid-stream.
    agg_node.input_received(stub, 1, int_batch(vec![10, 20]));
    assert!(out.next().now_or_never().is_none(), "no output yet");
    agg_node.input_received(stub, 0, int_batch(vec![1, 2]));
    agg_node.input_finished(stub, 3);
    assert!(out.next().now_or_never().is_none(), "still one batch short");
    agg_node.input_received(stub, 2, int_batch(vec![100]));

    let batch = out
        .next()
        .now_or_never()
        .flatten()
        .expect("one output batch")
        .expect("ok batch");
    assert_eq!(int_column(&batch, "cnt"), vec![5]);
    assert_eq!(int_column(&batch, "total"), vec![133]);
    assert!(out.next().now_or_never().flatten().is_none(), "exactly one");
    assert!(agg_node.finished().is_finished());
}

#[test]
fn group_by_merges_groups_across_batches() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: batches_stream(
                kv_schema(),
                vec![
                    kv_batch(vec![("a", 1), ("b", 2), ("a", 3)]),
                    kv_batch(vec![("b", 4), ("a", 5), ("a", 6)]),
                ],
            ),
        },
    )
    .expect("source");
    let group_by = GroupByNode::make(
        &plan,
        source,
        GroupByOptions {
            label: None,
            keys: vec![(Expr::col("k"), None)],
            aggregates: vec![
                (AggExpr::Count(Expr::col("v")), Some("cnt".to_string())),
                (AggExpr::Sum(Expr::col("v")), Some("sum_v".to_string())),
            ],
        },
    )
    .expect("group by");
    let (_sink, out) = SinkNode::make(&plan, group_by, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    assert_eq!(batches.len(), 1);
    let batch = batches[0].as_ref().expect("batch");

    // Group output order is unspecified; sort by key before asserting.
    let keys = string_column(batch, "k");
    let counts = int_column(batch, "cnt");
    let sums = int_column(batch, "sum_v");
    let mut rows: Vec<(String, i64, i64)> = keys
        .into_iter()
        .zip(counts)
        .zip(sums)
        .map(|((k, c), s)| (k, c, s))
        .collect();
    rows.sort();
    assert_eq!(
        rows,
        vec![("a".to_string(), 4, 15), ("b".to_string(), 2, 6)]
    );
}

#[test]
fn scalar_aggregate_on_empty_input_yields_identity_row() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: empty_stream(int_schema()),
        },
    )
    .expect("source");
    let agg = ScalarAggregateNode::make(
        &plan,
        source,
        AggregateOptions {
            label: None,
            aggregates: vec![(AggExpr::Count(Expr::col("x")), Some("cnt".to_string()))],
        },
    )
    .expect("aggregate");
    let (_sink, out) = SinkNode::make(&plan, agg, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    assert_eq!(batches.len(), 1);
    let batch = batches[0].as_ref().expect("batch");
    assert_eq!(int_column(batch, "cnt"), vec![0]);
}

#[test]
fn group_by_on_empty_input_yields_no_groups() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: empty_stream(kv_schema()),
        },
    )
    .expect("source");
    let group_by = GroupByNode::make(
        &plan,
        source,
        GroupByOptions {
            label: None,
            keys: vec![(Expr::col("k"), None)],
            aggregates: vec![(AggExpr::Count(Expr::col("v")), None)],
        },
    )
    .expect("group by");
    let (_sink, out) = SinkNode::make(&plan, group_by, None).expect("sink");

    plan.start_producing().expect("start");
    let batches = collect(out);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].as_ref().expect("batch").num_rows(), 0);
}

#[test]
fn sink_yields_batches_in_arrival_order() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let stub = StubSource::make(&plan, int_schema()).expect("stub");
    let (sink, mut out) = SinkNode::make(&plan, stub, None).expect("sink");
    plan.start_producing().expect("start");

    let sink_node = plan.node(sink).expect("sink node");
    sink_node.input_received(stub, 2, int_batch(vec![30]));
    sink_node.input_received(stub, 0, int_batch(vec![10]));
    sink_node.input_received(stub, 1, int_batch(vec![20]));
    sink_node.input_finished(stub, 3);

    let mut seen = Vec::new();
    while let Some(item) = out.next().now_or_never().flatten() {
        seen.extend(int_column(&item.expect("batch"), "x"));
    }
    assert_eq!(seen, vec![30, 10, 20]);
}

#[test]
fn unknown_column_is_rejected_at_build_time() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: empty_stream(int_schema()),
        },
    )
    .expect("source");
    let err = FilterNode::make(
        &plan,
        source,
        FilterOptions {
            label: None,
            predicate: Expr::col("nope").binary(BinaryOp::Gt, Expr::lit(LiteralValue::Int64(0))),
        },
    )
    .expect_err("unknown column");
    assert!(matches!(err, brook_common::BrookError::Expression(_)));
}

#[test]
fn non_boolean_predicate_is_rejected_at_build_time() {
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: empty_stream(int_schema()),
        },
    )
    .expect("source");
    let err = FilterNode::make(
        &plan,
        source,
        FilterOptions {
            label: None,
            predicate: Expr::col("x").binary(BinaryOp::Plus, Expr::lit(LiteralValue::Int64(1))),
        },
    )
    .expect_err("non-boolean predicate");
    assert!(matches!(err, brook_common::BrookError::Expression(_)));
}

#[test]
fn sync_source_drains_streams_deeper_than_the_sink_watermark() {
    // Without a runtime the whole stream is pulled on the starting thread.
    // The sink's backlog crosses its pause watermark long before anything
    // drains it, so the pull loop must keep going rather than wait for a
    // resume that can only come from this thread.
    let plan = ExecPlan::try_new(ExecContext::default()).expect("plan");
    let batches: Vec<RecordBatch> = (0..20).map(|i| int_batch(vec![i])).collect();
    let source = SourceNode::make(
        &plan,
        SourceOptions {
            label: None,
            stream: batches_stream(int_schema(), batches),
        },
    )
    .expect("source");
    let (_sink, out) = SinkNode::make(&plan, source, None).expect("sink");

    plan.start_producing().expect("start returns with the stream drained");
    let collected = collect(out);
    assert_eq!(collected.len(), 20);
    for (i, item) in collected.iter().enumerate() {
        let batch = item.as_ref().expect("batch");
        assert_eq!(int_column(batch, "x"), vec![i as i64]);
    }
    assert!(matches!(plan.finished().peek(), Some(Ok(()))));
}
