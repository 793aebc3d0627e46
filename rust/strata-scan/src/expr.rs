// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Residual filter expressions
//!
//! Whatever part of a filter cannot be pushed to storage as a subfield filter
//! is kept as an [`Expr`] and evaluated with Arrow kernels on the columns of
//! each batch. Columns are pulled from a [`ColumnSource`] by name, which lets
//! a lazy batch decide when (and for which rows) to decode them.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use arrow_arith::boolean::{and_kleene, is_not_null, is_null, not, or_kleene};
use arrow_arith::numeric;
use arrow_array::{Array, ArrayRef, BooleanArray, Datum, RecordBatch};
use arrow_ord::cmp;
use arrow_schema::{DataType, Schema};
use datafusion_common::ScalarValue;
use snafu::location;
use strata_core::{Error, Result};

use crate::filter::{extract_subfield, PathElement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// The operator to use when the operands are swapped
    pub fn flip(&self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::NotEq => Self::NotEq,
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(ScalarValue),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Vec<ScalarValue>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: ScalarValue,
        high: ScalarValue,
    },
    /// A struct field, list element or map value of `expr`
    GetField {
        expr: Box<Expr>,
        element: PathElement,
    },
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Literal(value.into())
}

#[allow(clippy::should_implement_trait)]
impl Expr {
    fn compare(self, op: CompareOp, other: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    fn arithmetic(self, op: ArithmeticOp, other: Self) -> Self {
        Self::Arithmetic {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Self) -> Self {
        self.compare(CompareOp::Eq, other)
    }

    pub fn not_eq(self, other: Self) -> Self {
        self.compare(CompareOp::NotEq, other)
    }

    pub fn lt(self, other: Self) -> Self {
        self.compare(CompareOp::Lt, other)
    }

    pub fn lt_eq(self, other: Self) -> Self {
        self.compare(CompareOp::LtEq, other)
    }

    pub fn gt(self, other: Self) -> Self {
        self.compare(CompareOp::Gt, other)
    }

    pub fn gt_eq(self, other: Self) -> Self {
        self.compare(CompareOp::GtEq, other)
    }

    pub fn plus(self, other: Self) -> Self {
        self.arithmetic(ArithmeticOp::Plus, other)
    }

    pub fn minus(self, other: Self) -> Self {
        self.arithmetic(ArithmeticOp::Minus, other)
    }

    pub fn multiply(self, other: Self) -> Self {
        self.arithmetic(ArithmeticOp::Multiply, other)
    }

    pub fn divide(self, other: Self) -> Self {
        self.arithmetic(ArithmeticOp::Divide, other)
    }

    pub fn modulo(self, other: Self) -> Self {
        self.arithmetic(ArithmeticOp::Modulo, other)
    }

    /// `self AND other`, flattening nested conjunctions
    pub fn and(self, other: Self) -> Self {
        let mut conjuncts = self.into_conjuncts();
        conjuncts.extend(other.into_conjuncts());
        Self::And(conjuncts)
    }

    pub fn or(self, other: Self) -> Self {
        let mut disjuncts = match self {
            Self::Or(items) => items,
            other => vec![other],
        };
        match other {
            Self::Or(items) => disjuncts.extend(items),
            other => disjuncts.push(other),
        }
        Self::Or(disjuncts)
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Self {
        Self::IsNotNull(Box::new(self))
    }

    pub fn in_list(self, list: Vec<ScalarValue>, negated: bool) -> Self {
        Self::InList {
            expr: Box::new(self),
            list,
            negated,
        }
    }

    pub fn between(self, low: impl Into<ScalarValue>, high: impl Into<ScalarValue>) -> Self {
        Self::Between {
            expr: Box::new(self),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn field(self, name: impl Into<String>) -> Self {
        Self::GetField {
            expr: Box::new(self),
            element: PathElement::NestedField(name.into()),
        }
    }

    pub fn subscript(self, element: PathElement) -> Self {
        Self::GetField {
            expr: Box::new(self),
            element,
        }
    }

    /// Split the top-level conjunction into its conjuncts
    pub fn into_conjuncts(self) -> Vec<Self> {
        match self {
            Self::And(items) => items.into_iter().flat_map(Self::into_conjuncts).collect(),
            other => vec![other],
        }
    }

    /// AND the expressions together. `None` for an empty input.
    pub fn conjunction(mut exprs: Vec<Self>) -> Option<Self> {
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Self::And(exprs)),
        }
    }

    fn children(&self) -> Vec<&Self> {
        match self {
            Self::Column(_) | Self::Literal(_) => vec![],
            Self::Compare { left, right, .. } | Self::Arithmetic { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            Self::And(items) | Self::Or(items) => items.iter().collect(),
            Self::Not(expr)
            | Self::IsNull(expr)
            | Self::IsNotNull(expr)
            | Self::InList { expr, .. }
            | Self::Between { expr, .. }
            | Self::GetField { expr, .. } => vec![expr.as_ref()],
        }
    }

    /// Names of every column the expression reads
    pub fn column_refs(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        self.collect_columns(&mut refs);
        refs
    }

    fn collect_columns(&self, refs: &mut BTreeSet<String>) {
        if let Self::Column(name) = self {
            refs.insert(name.clone());
        }
        for child in self.children() {
            child.collect_columns(refs);
        }
    }

    /// Whether evaluating the expression may need values of rows it rejects
    ///
    /// True for disjunctions, and for negations of conjunctions or disjunctions.
    pub fn has_disjunction(&self) -> bool {
        match self {
            Self::Or(_) => true,
            Self::Not(inner) if matches!(**inner, Self::And(_) | Self::Or(_)) => true,
            other => other.children().into_iter().any(Self::has_disjunction),
        }
    }

    /// If the expression is a (possibly nested) column reference, its root and path
    pub fn as_subfield(&self) -> Option<(String, Vec<PathElement>)> {
        match self {
            Self::Column(name) => Some((name.clone(), vec![])),
            Self::GetField { expr, element } => {
                let (root, mut path) = expr.as_subfield()?;
                path.push(element.clone());
                Some((root, path))
            }
            _ => None,
        }
    }

    /// Type of the values the expression produces over rows of `schema`
    ///
    /// Found by evaluating over zero rows, so it follows the same coercions as
    /// [`Self::evaluate`].
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        let mut empty = RecordBatch::new_empty(Arc::new(schema.clone()));
        Ok(self.evaluate(&mut empty)?.data_type())
    }

    /// Evaluate the expression against the rows of `source`
    pub fn evaluate(&self, source: &mut dyn ColumnSource) -> Result<Value> {
        match self {
            Self::Column(name) => Ok(Value::Array(source.column(name)?)),
            Self::Literal(value) => Ok(Value::Scalar(value.clone())),
            Self::Compare { op, left, right } => {
                let left = left.evaluate(source)?;
                let right = right.evaluate(source)?;
                let (left, right) = coerce(left, right)?;
                let (l, r) = (left.to_datum()?, right.to_datum()?);
                let result = match op {
                    CompareOp::Eq => cmp::eq(l.as_ref(), r.as_ref())?,
                    CompareOp::NotEq => cmp::neq(l.as_ref(), r.as_ref())?,
                    CompareOp::Lt => cmp::lt(l.as_ref(), r.as_ref())?,
                    CompareOp::LtEq => cmp::lt_eq(l.as_ref(), r.as_ref())?,
                    CompareOp::Gt => cmp::gt(l.as_ref(), r.as_ref())?,
                    CompareOp::GtEq => cmp::gt_eq(l.as_ref(), r.as_ref())?,
                };
                Value::from_result(Arc::new(result), left.is_scalar() && right.is_scalar())
            }
            Self::Arithmetic { op, left, right } => {
                let left = left.evaluate(source)?;
                let right = right.evaluate(source)?;
                let (left, right) = coerce(left, right)?;
                let (l, r) = (left.to_datum()?, right.to_datum()?);
                let result = match op {
                    ArithmeticOp::Plus => numeric::add(l.as_ref(), r.as_ref())?,
                    ArithmeticOp::Minus => numeric::sub(l.as_ref(), r.as_ref())?,
                    ArithmeticOp::Multiply => numeric::mul(l.as_ref(), r.as_ref())?,
                    ArithmeticOp::Divide => numeric::div(l.as_ref(), r.as_ref())?,
                    ArithmeticOp::Modulo => numeric::rem(l.as_ref(), r.as_ref())?,
                };
                Value::from_result(result, left.is_scalar() && right.is_scalar())
            }
            Self::And(items) | Self::Or(items) => {
                let is_and = matches!(self, Self::And(_));
                let mut result: Option<BooleanArray> = None;
                for item in items {
                    let mask = item.evaluate_mask(source)?;
                    result = Some(match result {
                        None => mask,
                        Some(acc) if is_and => and_kleene(&acc, &mask)?,
                        Some(acc) => or_kleene(&acc, &mask)?,
                    });
                }
                let result = result.unwrap_or_else(|| {
                    BooleanArray::from(vec![is_and; source.num_rows()])
                });
                Ok(Value::Array(Arc::new(result)))
            }
            Self::Not(inner) => {
                let mask = inner.evaluate_mask(source)?;
                Ok(Value::Array(Arc::new(not(&mask)?)))
            }
            Self::IsNull(inner) | Self::IsNotNull(inner) => {
                let array = inner.evaluate(source)?.into_array(source.num_rows())?;
                let result = if matches!(self, Self::IsNull(_)) {
                    is_null(array.as_ref())?
                } else {
                    is_not_null(array.as_ref())?
                };
                Ok(Value::Array(Arc::new(result)))
            }
            Self::InList {
                expr,
                list,
                negated,
            } => {
                let array = expr.evaluate(source)?.into_array(source.num_rows())?;
                let mut result: Option<BooleanArray> = None;
                for value in list {
                    let value = value.cast_to(array.data_type())?.to_scalar()?;
                    let matches = cmp::eq(&array, &value)?;
                    result = Some(match result {
                        Some(acc) => or_kleene(&acc, &matches)?,
                        None => matches,
                    });
                }
                let result =
                    result.unwrap_or_else(|| BooleanArray::from(vec![false; array.len()]));
                let result = if *negated { not(&result)? } else { result };
                Ok(Value::Array(Arc::new(result)))
            }
            Self::Between { expr, low, high } => {
                let array = expr.evaluate(source)?.into_array(source.num_rows())?;
                let low = low.cast_to(array.data_type())?.to_scalar()?;
                let high = high.cast_to(array.data_type())?.to_scalar()?;
                let result = and_kleene(&cmp::gt_eq(&array, &low)?, &cmp::lt_eq(&array, &high)?)?;
                Ok(Value::Array(Arc::new(result)))
            }
            Self::GetField { expr, element } => {
                let array = expr.evaluate(source)?.into_array(source.num_rows())?;
                Ok(Value::Array(extract_subfield(
                    &array,
                    std::slice::from_ref(element),
                )?))
            }
        }
    }

    /// Evaluate a boolean expression into one entry per row
    pub fn evaluate_mask(&self, source: &mut dyn ColumnSource) -> Result<BooleanArray> {
        let num_rows = source.num_rows();
        let array = self.evaluate(source)?.into_array(num_rows)?;
        array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .cloned()
            .ok_or_else(|| {
                Error::invalid_input(
                    format!("Filter {} evaluates to {}, not a boolean", self, array.data_type()),
                    location!(),
                )
            })
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let join = |f: &mut Formatter<'_>, items: &[Self], sep: &str| -> std::fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, ")")
        };
        match self {
            Self::Column(name) => write!(f, "{}", name),
            Self::Literal(value) => write!(f, "{}", value),
            Self::Compare { op, left, right } => {
                let op = match op {
                    CompareOp::Eq => "=",
                    CompareOp::NotEq => "<>",
                    CompareOp::Lt => "<",
                    CompareOp::LtEq => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::GtEq => ">=",
                };
                write!(f, "{} {} {}", left, op, right)
            }
            Self::Arithmetic { op, left, right } => {
                let op = match op {
                    ArithmeticOp::Plus => "+",
                    ArithmeticOp::Minus => "-",
                    ArithmeticOp::Multiply => "*",
                    ArithmeticOp::Divide => "/",
                    ArithmeticOp::Modulo => "%",
                };
                write!(f, "({} {} {})", left, op, right)
            }
            Self::And(items) => join(f, items, "AND"),
            Self::Or(items) => join(f, items, "OR"),
            Self::Not(inner) => write!(f, "NOT {}", inner),
            Self::IsNull(inner) => write!(f, "{} IS NULL", inner),
            Self::IsNotNull(inner) => write!(f, "{} IS NOT NULL", inner),
            Self::InList {
                expr,
                list,
                negated,
            } => {
                let values: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}IN ({})", expr, not, values.join(", "))
            }
            Self::Between { expr, low, high } => {
                write!(f, "{} BETWEEN {} AND {}", expr, low, high)
            }
            Self::GetField { expr, element } => match element {
                PathElement::NestedField(name) => write!(f, "{}.{}", expr, name),
                PathElement::LongSubscript(index) => write!(f, "{}[{}]", expr, index),
                PathElement::StringSubscript(key) => write!(f, "{}[\"{}\"]", expr, key),
            },
        }
    }
}

/// The result of evaluating an expression
#[derive(Debug, Clone)]
pub enum Value {
    Array(ArrayRef),
    Scalar(ScalarValue),
}

impl Value {
    fn from_result(result: ArrayRef, scalar: bool) -> Result<Self> {
        if scalar {
            Ok(Self::Scalar(ScalarValue::try_from_array(&result, 0)?))
        } else {
            Ok(Self::Array(result))
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    fn data_type(&self) -> DataType {
        match self {
            Self::Array(array) => array.data_type().clone(),
            Self::Scalar(value) => value.data_type(),
        }
    }

    fn to_datum(&self) -> Result<Box<dyn Datum>> {
        Ok(match self {
            Self::Array(array) => Box::new(array.clone()),
            Self::Scalar(value) => Box::new(value.to_scalar()?),
        })
    }

    fn cast_to(self, data_type: &arrow_schema::DataType) -> Result<Self> {
        Ok(match self {
            Self::Array(array) => Self::Array(arrow_cast::cast(array.as_ref(), data_type)?),
            Self::Scalar(value) => Self::Scalar(value.cast_to(data_type)?),
        })
    }

    pub fn into_array(self, num_rows: usize) -> Result<ArrayRef> {
        match self {
            Self::Array(array) => Ok(array),
            Self::Scalar(value) => Ok(value.to_array_of_size(num_rows)?),
        }
    }
}

/// Bring both operands to one type. Literals adopt the type of the column side.
fn coerce(left: Value, right: Value) -> Result<(Value, Value)> {
    let (lt, rt) = (left.data_type(), right.data_type());
    if lt == rt {
        return Ok((left, right));
    }
    match (&left, &right) {
        (Value::Array(_), Value::Scalar(_)) => Ok((left, right.cast_to(&lt)?)),
        (Value::Scalar(_), Value::Array(_)) => Ok((left.cast_to(&rt)?, right)),
        _ => Ok((left, right.cast_to(&lt)?)),
    }
}

/// Something that can hand out the columns of a batch by name
pub trait ColumnSource {
    fn num_rows(&self) -> usize;

    fn column(&mut self, name: &str) -> Result<ArrayRef>;
}

impl ColumnSource for RecordBatch {
    fn num_rows(&self) -> usize {
        Self::num_rows(self)
    }

    fn column(&mut self, name: &str) -> Result<ArrayRef> {
        self.column_by_name(name).cloned().ok_or_else(|| {
            Error::invalid_input(format!("No column named {}", name), location!())
        })
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int32Array, Int64Array};
    use arrow_schema::Field;

    use super::*;

    fn batch() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("c0", DataType::Int64, true),
                Field::new("c1", DataType::Int32, true),
            ])),
            vec![
                Arc::new(Int64Array::from(vec![Some(0), Some(1), Some(2), None, Some(4), Some(6)])),
                Arc::new(Int32Array::from(vec![3, 3, 5, 6, 9, 1])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_evaluate_arithmetic_filter() {
        let filter = col("c0")
            .modulo(lit(2i64))
            .eq(lit(0i64))
            .and(col("c1").modulo(lit(3)).eq(lit(0)));
        let mask = filter.evaluate_mask(&mut batch()).unwrap();
        assert_eq!(
            mask,
            BooleanArray::from(vec![Some(true), Some(false), Some(false), None, Some(true), Some(false)])
        );
        assert_eq!(filter.to_string(), "((c0 % 2) = 0 AND (c1 % 3) = 0)");
    }

    #[test]
    fn test_data_type() {
        let schema = batch().schema();
        assert_eq!(col("c0").plus(lit(1i64)).data_type(&schema).unwrap(), DataType::Int64);
        // Literals take the type of the column they meet
        assert_eq!(col("c1").multiply(lit(2i64)).data_type(&schema).unwrap(), DataType::Int32);
        assert_eq!(col("c0").gt(lit(1i64)).data_type(&schema).unwrap(), DataType::Boolean);
        assert_eq!(lit(1.5f64).data_type(&schema).unwrap(), DataType::Float64);
        assert!(col("c9").data_type(&schema).is_err());
    }

    #[test]
    fn test_literal_coercion_and_in_list() {
        // An Int32 literal against an Int64 column
        let mask = col("c0").gt(lit(1i32)).evaluate_mask(&mut batch()).unwrap();
        assert_eq!(mask.true_count(), 3);

        let mask = col("c1")
            .in_list(vec![ScalarValue::Int64(Some(3)), ScalarValue::Int64(Some(9))], true)
            .evaluate_mask(&mut batch())
            .unwrap();
        assert_eq!(mask, BooleanArray::from(vec![false, false, true, true, false, true]));

        let mask = col("c0").between(1i64, 4i64).evaluate_mask(&mut batch()).unwrap();
        assert_eq!(mask.true_count(), 3);
    }

    #[test]
    fn test_conjuncts_and_disjunctions() {
        let filter = col("a")
            .gt(lit(1))
            .and(col("b").eq(lit(2)).or(col("c").is_null()))
            .and(col("a").lt(lit(10)).and(col("d").is_not_null()).not());
        let conjuncts = filter.clone().into_conjuncts();
        assert_eq!(conjuncts.len(), 3);
        assert!(!conjuncts[0].has_disjunction());
        assert!(conjuncts[1].has_disjunction());
        assert!(conjuncts[2].has_disjunction());
        assert!(!col("a").is_null().not().has_disjunction());
        assert_eq!(
            filter.column_refs().into_iter().collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
        assert_eq!(
            col("s").field("x").subscript(PathElement::LongSubscript(1)).as_subfield(),
            Some((
                "s".to_string(),
                vec![
                    PathElement::NestedField("x".to_string()),
                    PathElement::LongSubscript(1)
                ]
            ))
        );
    }

    #[test]
    fn test_non_boolean_filter() {
        let err = col("c0").plus(lit(1i64)).evaluate_mask(&mut batch()).unwrap_err();
        assert!(err.to_string().contains("not a boolean"));
    }
}
