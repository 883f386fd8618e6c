//! Incremental aggregation kernels.
//!
//! Pipeline breakers push batches one at a time, so the kernels here are
//! fold-style: init per-aggregate state, update it per row, finalize once the
//! input is drained. Group keys are converted to hashable [`ScalarValue`]
//! rows and encoded to stable byte keys for the group map.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Array, Int64Builder, StringBuilder,
};
use arrow_schema::{DataType, SchemaRef};
use brook_common::{BrookError, Result};

use crate::expr::AggExpr;
use crate::physical::compile_expr;

/// Owned scalar used as a group-key component and min/max state.
///
/// Floats are stored by bit pattern so keys hash and compare consistently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl ScalarValue {
    /// Approximate heap footprint, used for memory-budget accounting.
    pub fn estimate_bytes(&self) -> usize {
        match self {
            ScalarValue::Int64(_) | ScalarValue::Float64Bits(_) => 8,
            ScalarValue::Utf8(s) => s.len(),
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Null => 0,
        }
    }
}

/// Read one row of `array` into an owned scalar.
pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| BrookError::Execution("expected Int64Array".to_string()))?;
            Ok(ScalarValue::Int64(a.value(row)))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Float64Array>()
                .ok_or_else(|| BrookError::Execution("expected Float64Array".to_string()))?;
            Ok(ScalarValue::Float64Bits(a.value(row).to_bits()))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .ok_or_else(|| BrookError::Execution("expected StringArray".to_string()))?;
            Ok(ScalarValue::Utf8(a.value(row).to_string()))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::BooleanArray>()
                .ok_or_else(|| BrookError::Execution("expected BooleanArray".to_string()))?;
            Ok(ScalarValue::Boolean(a.value(row)))
        }
        other => Err(BrookError::Execution(format!(
            "group/aggregate scalar type not supported: {other:?}"
        ))),
    }
}

/// Build a typed array from a column of scalars.
pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(BrookError::Execution(
                            "type mismatch while building Int64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                    ScalarValue::Int64(x) => b.append_value(*x as f64),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(BrookError::Execution(
                            "type mismatch while building Float64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(BrookError::Execution(
                            "type mismatch while building Utf8 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(BrookError::Execution(
                            "type mismatch while building Boolean array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(BrookError::Execution(format!(
            "aggregate output type not supported: {other:?}"
        ))),
    }
}

/// Encode a group key row into stable bytes for map lookup.
pub fn encode_group_key(values: &[ScalarValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 16);
    for value in values {
        match value {
            ScalarValue::Null => out.push(0),
            ScalarValue::Int64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Float64Bits(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Boolean(v) => {
                out.push(3);
                out.push(u8::from(*v));
            }
            ScalarValue::Utf8(s) => {
                out.push(4);
                let len = s.len() as u32;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
        out.push(0xff);
    }
    out
}

/// One declared aggregate: function, output name, resolved output type.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub expr: AggExpr,
    pub name: String,
    pub out_type: DataType,
}

/// Resolve aggregate declarations against the input schema.
///
/// Missing names default to the aggregate's display form
/// (e.g. `count(key)`). Unknown source columns fail here.
pub fn build_agg_specs(
    aggr_exprs: &[(AggExpr, Option<String>)],
    input_schema: &SchemaRef,
) -> Result<Vec<AggSpec>> {
    let mut specs = Vec::with_capacity(aggr_exprs.len());
    for (expr, name) in aggr_exprs {
        let value_type = compile_expr(expr.input(), input_schema)?.data_type();
        let out_type = match expr {
            AggExpr::Count(_) => DataType::Int64,
            AggExpr::Sum(_) => match value_type {
                DataType::Int64 => DataType::Int64,
                DataType::Float64 => DataType::Float64,
                other => {
                    return Err(BrookError::Expression(format!(
                        "sum not supported for {other:?}"
                    )));
                }
            },
            AggExpr::Min(_) | AggExpr::Max(_) => value_type,
            AggExpr::Avg(_) => DataType::Float64,
        };
        specs.push(AggSpec {
            expr: expr.clone(),
            name: name.clone().unwrap_or_else(|| expr.to_string()),
            out_type,
        });
    }
    Ok(specs)
}

/// Accumulator state for one aggregate within one group.
#[derive(Debug, Clone)]
pub enum AggState {
    Count(i64),
    SumInt(i64),
    SumFloat(f64),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

impl AggState {
    /// Approximate heap footprint, used for memory-budget accounting.
    pub fn estimate_bytes(&self) -> usize {
        match self {
            AggState::Count(_) | AggState::SumInt(_) | AggState::SumFloat(_) => 8,
            AggState::Min(x) | AggState::Max(x) => {
                x.as_ref().map_or(0, ScalarValue::estimate_bytes)
            }
            AggState::Avg { .. } => 16,
        }
    }
}

/// Fresh state vector for one group.
pub fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs
        .iter()
        .map(|s| match s.expr {
            AggExpr::Count(_) => AggState::Count(0),
            AggExpr::Sum(_) => match s.out_type {
                DataType::Int64 => AggState::SumInt(0),
                _ => AggState::SumFloat(0.0),
            },
            AggExpr::Min(_) => AggState::Min(None),
            AggExpr::Max(_) => AggState::Max(None),
            AggExpr::Avg(_) => AggState::Avg { sum: 0.0, count: 0 },
        })
        .collect()
}

/// Fold one value into accumulator state. Nulls never contribute.
pub fn update_state(state: &mut AggState, value: ScalarValue) -> Result<()> {
    match state {
        AggState::Count(acc) => {
            if value != ScalarValue::Null {
                *acc += 1;
            }
        }
        AggState::SumInt(acc) => {
            if let ScalarValue::Int64(v) = value {
                *acc += v;
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = as_f64(&value) {
                *acc += v;
            }
        }
        AggState::Min(cur) => {
            if value != ScalarValue::Null {
                match cur {
                    None => *cur = Some(value),
                    Some(existing) => {
                        if scalar_lt(&value, existing)? {
                            *cur = Some(value);
                        }
                    }
                }
            }
        }
        AggState::Max(cur) => {
            if value != ScalarValue::Null {
                match cur {
                    None => *cur = Some(value),
                    Some(existing) => {
                        if scalar_gt(&value, existing)? {
                            *cur = Some(value);
                        }
                    }
                }
            }
        }
        AggState::Avg { sum, count } => {
            if let Some(v) = as_f64(&value) {
                *sum += v;
                *count += 1;
            }
        }
    }
    Ok(())
}

/// Convert finished state to its output scalar.
pub fn finalize_state(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => ScalarValue::Int64(*v),
        AggState::SumFloat(v) => ScalarValue::Float64Bits(v.to_bits()),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { sum, count } => {
            if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::Float64Bits((sum / *count as f64).to_bits())
            }
        }
    }
}

/// One group's key row plus its accumulator states.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub key: Vec<ScalarValue>,
    pub states: Vec<AggState>,
}

/// Group map keyed by the encoded key row.
pub type GroupMap = HashMap<Vec<u8>, GroupEntry>;

fn as_f64(v: &ScalarValue) -> Option<f64> {
    match v {
        ScalarValue::Int64(x) => Some(*x as f64),
        ScalarValue::Float64Bits(x) => Some(f64::from_bits(*x)),
        _ => None,
    }
}

fn scalar_lt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    match (a, b) {
        (ScalarValue::Int64(x), ScalarValue::Int64(y)) => Ok(x < y),
        (ScalarValue::Float64Bits(x), ScalarValue::Float64Bits(y)) => {
            Ok(f64::from_bits(*x) < f64::from_bits(*y))
        }
        (ScalarValue::Utf8(x), ScalarValue::Utf8(y)) => Ok(x < y),
        (ScalarValue::Boolean(x), ScalarValue::Boolean(y)) => Ok((!*x) & *y),
        _ => Err(BrookError::Execution(
            "cannot compare values of different types".to_string(),
        )),
    }
}

fn scalar_gt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    scalar_lt(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use arrow_schema::{Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]))
    }

    #[test]
    fn specs_default_names_and_types() {
        let specs = build_agg_specs(
            &[
                (AggExpr::Count(Expr::col("k")), None),
                (AggExpr::Avg(Expr::col("v")), Some("mean".to_string())),
            ],
            &schema(),
        )
        .unwrap();
        assert_eq!(specs[0].name, "count(k)");
        assert_eq!(specs[0].out_type, DataType::Int64);
        assert_eq!(specs[1].name, "mean");
        assert_eq!(specs[1].out_type, DataType::Float64);
    }

    #[test]
    fn specs_reject_unknown_source_column() {
        let err = build_agg_specs(&[(AggExpr::Sum(Expr::col("nope")), None)], &schema());
        assert!(err.is_err());
    }

    #[test]
    fn fold_and_finalize_basic_aggregates() {
        let specs = build_agg_specs(
            &[
                (AggExpr::Count(Expr::col("v")), None),
                (AggExpr::Sum(Expr::col("v")), None),
                (AggExpr::Min(Expr::col("v")), None),
                (AggExpr::Avg(Expr::col("v")), None),
            ],
            &schema(),
        )
        .unwrap();
        let mut states = init_states(&specs);
        for v in [3_i64, 1, 2] {
            for s in states.iter_mut() {
                update_state(s, ScalarValue::Int64(v)).unwrap();
            }
        }
        // Null contributes to nothing.
        for s in states.iter_mut() {
            update_state(s, ScalarValue::Null).unwrap();
        }
        assert_eq!(finalize_state(&states[0]), ScalarValue::Int64(3));
        assert_eq!(finalize_state(&states[1]), ScalarValue::Int64(6));
        assert_eq!(finalize_state(&states[2]), ScalarValue::Int64(1));
        assert_eq!(
            finalize_state(&states[3]),
            ScalarValue::Float64Bits(2.0_f64.to_bits())
        );
    }

    #[test]
    fn encoded_keys_distinguish_types_and_values() {
        let a = encode_group_key(&[ScalarValue::Int64(1)]);
        let b = encode_group_key(&[ScalarValue::Int64(2)]);
        let c = encode_group_key(&[ScalarValue::Boolean(true)]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, encode_group_key(&[ScalarValue::Int64(1)]));
    }
}
