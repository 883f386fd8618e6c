//! Expression compilation and evaluation.
//!
//! Input contract:
//! - node constructors hand in [`Expr`] trees with name-based column refs;
//! - compilation binds them against the node's input schema.
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to the input batch row count.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use brook_common::{BrookError, Result};

use crate::expr::{BinaryOp, Expr, LiteralValue};

/// Executable expression bound to a concrete input schema.
///
/// Compilation happens once at node construction; evaluation runs per batch
/// and may be called concurrently, so implementations hold no mutable state.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Bind an [`Expr`] against `input_schema`, resolving column names to indices.
///
/// Binding failures (unknown columns, operand type mismatches) surface here,
/// at construction time, as [`BrookError::Expression`].
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(name) => {
            let index = input_schema
                .fields()
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| BrookError::Expression(format!("unknown column: {name}")))?;
            let dt = input_schema.field(index).data_type().clone();
            Ok(Arc::new(ColumnExpr { index, dt }))
        }

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr {
            v: v.clone(),
            dt: literal_type(v),
        })),

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }

        Expr::Not(e) => {
            let inner = compile_expr(e, input_schema)?;
            if inner.data_type() != DataType::Boolean {
                return Err(BrookError::Expression(format!(
                    "not expects a boolean operand, got {:?}",
                    inner.data_type()
                )));
            }
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::And(a, b) => compile_bool_binary(a, b, BoolOp::And, input_schema),
        Expr::Or(a, b) => compile_bool_binary(a, b, BoolOp::Or, input_schema),

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema)?;
            let r = compile_expr(right, input_schema)?;
            let out = binary_out_type(*op, l.data_type(), r.data_type())?;
            Ok(Arc::new(BinaryExpr {
                left: l,
                right: r,
                op: *op,
                out,
            }))
        }
    }
}

fn compile_bool_binary(
    a: &Expr,
    b: &Expr,
    op: BoolOp,
    input_schema: &SchemaRef,
) -> Result<Arc<dyn PhysicalExpr>> {
    let left = compile_expr(a, input_schema)?;
    let right = compile_expr(b, input_schema)?;
    for side in [&left, &right] {
        if side.data_type() != DataType::Boolean {
            return Err(BrookError::Expression(format!(
                "and/or expects boolean operands, got {:?}",
                side.data_type()
            )));
        }
    }
    Ok(Arc::new(BoolBinaryExpr { left, right, op }))
}

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.index >= batch.num_columns() {
            return Err(BrookError::Execution(format!(
                "batch has {} columns, column index {} out of range",
                batch.num_columns(),
                self.index
            )));
        }
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: LiteralValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        scalar_to_array(&self.v, batch.num_rows())
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| BrookError::Execution(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = as_boolean(&arr)?;
        let out = not(b).map_err(|e| BrookError::Execution(format!("not kernel failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let lb = as_boolean(&l)?;
        let rb = as_boolean(&r)?;
        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(|e| BrookError::Execution(format!("boolean kernel failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if l.data_type() != r.data_type() {
            return Err(BrookError::Execution(format!(
                "binary operands diverged at runtime: {:?} vs {:?}",
                l.data_type(),
                r.data_type()
            )));
        }
        match self.op {
            BinaryOp::Plus => {
                add(&l, &r).map_err(|e| BrookError::Execution(format!("arith kernel failed: {e}")))
            }
            BinaryOp::Minus => {
                sub(&l, &r).map_err(|e| BrookError::Execution(format!("arith kernel failed: {e}")))
            }
            BinaryOp::Multiply => {
                mul(&l, &r).map_err(|e| BrookError::Execution(format!("arith kernel failed: {e}")))
            }
            BinaryOp::Divide => {
                div(&l, &r).map_err(|e| BrookError::Execution(format!("arith kernel failed: {e}")))
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => {
                let res = match self.op {
                    BinaryOp::Eq => eq(&l, &r),
                    BinaryOp::NotEq => neq(&l, &r),
                    BinaryOp::Lt => lt(&l, &r),
                    BinaryOp::LtEq => lt_eq(&l, &r),
                    BinaryOp::Gt => gt(&l, &r),
                    BinaryOp::GtEq => gt_eq(&l, &r),
                    _ => unreachable!(),
                }
                .map_err(|e| BrookError::Execution(format!("cmp kernel failed: {e}")))?;
                Ok(Arc::new(res) as ArrayRef)
            }
        }
    }
}

fn as_boolean(arr: &ArrayRef) -> Result<&BooleanArray> {
    arr.as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| BrookError::Execution("expected a boolean array".to_string()))
}

fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Null => DataType::Null,
    }
}

fn scalar_to_array(v: &LiteralValue, len: usize) -> Result<ArrayRef> {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Null => Ok(arrow::array::new_null_array(&DataType::Null, len)),
    }
}

fn binary_out_type(op: BinaryOp, l: DataType, r: DataType) -> Result<DataType> {
    match op {
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => {
            if l != r {
                return Err(BrookError::Expression(format!(
                    "comparison operands must share a type; got {l:?} vs {r:?} (insert a cast)"
                )));
            }
            Ok(DataType::Boolean)
        }

        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
            if l != r {
                return Err(BrookError::Expression(format!(
                    "arithmetic operands must share a type; got {l:?} vs {r:?} (insert a cast)"
                )));
            }
            Ok(l)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};
    use crate::expr::Expr as E;

    fn test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Int64Array::from(vec![3, 2, 1])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn compile_resolves_columns_by_name() {
        let batch = test_batch();
        let expr = compile_expr(&E::col("b"), &batch.schema()).unwrap();
        assert_eq!(expr.data_type(), DataType::Int64);
        let arr = expr.evaluate(&batch).unwrap();
        let arr = arr.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(arr.values(), &[3, 2, 1]);
    }

    #[test]
    fn unknown_column_fails_at_compile_time() {
        let batch = test_batch();
        let err = compile_expr(&E::col("missing"), &batch.schema())
            .err()
            .expect("compile should fail");
        assert!(matches!(err, BrookError::Expression(_)));
    }

    #[test]
    fn comparison_yields_boolean_selection() {
        let batch = test_batch();
        let expr = compile_expr(
            &E::col("a").binary(BinaryOp::Lt, E::col("b")),
            &batch.schema(),
        )
        .unwrap();
        let arr = expr.evaluate(&batch).unwrap();
        let arr = arr.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert_eq!(
            (0..3).map(|i| arr.value(i)).collect::<Vec<_>>(),
            vec![true, false, false]
        );
    }

    #[test]
    fn arithmetic_requires_matching_types() {
        let batch = test_batch();
        let err = compile_expr(
            &E::col("a").binary(BinaryOp::Plus, E::lit(LiteralValue::Float64(1.0))),
            &batch.schema(),
        )
        .err()
        .expect("compile should fail");
        assert!(matches!(err, BrookError::Expression(_)));
    }
}
