// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Split a filter into pushable subfield filters and a residual expression
//!
//! Every top-level conjunct that compares a column (or a nested path of one)
//! with literals is turned into a [`FilterCondition`]. The rest is evaluated
//! after decoding.

use std::ops::Bound;

use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use snafu::location;
use strata_core::{Error, Result};

use crate::column::{ColumnKind, ScanProjection};
use crate::expr::{CompareOp, Expr};
use crate::filter::{FilterCondition, PathElement, Subfield, SubfieldFilters};

/// The result of compiling a filter
#[derive(Debug, Clone, Default)]
pub struct CompiledPredicate {
    /// Filters keyed by physical subfield
    pub filters: SubfieldFilters,
    /// What could not be pushed down
    pub residual: Option<Expr>,
}

/// Resolves the type of a nested path inside `data_type`
pub fn subfield_type(data_type: &DataType, path: &[PathElement]) -> Result<DataType> {
    let Some((element, rest)) = path.split_first() else {
        return Ok(data_type.clone());
    };
    let child = match (element, data_type) {
        (PathElement::NestedField(name), DataType::Struct(fields)) => fields
            .find(name)
            .map(|(_, field)| field.data_type().clone()),
        (PathElement::LongSubscript(_), DataType::List(item)) => Some(item.data_type().clone()),
        (PathElement::StringSubscript(_), DataType::Map(entries, _)) => match entries.data_type() {
            DataType::Struct(fields) if fields.len() == 2 => Some(fields[1].data_type().clone()),
            _ => None,
        },
        _ => None,
    };
    let child = child.ok_or_else(|| {
        Error::invalid_input(
            format!("Cannot apply {:?} to a value of type {}", element, data_type),
            location!(),
        )
    })?;
    subfield_type(&child, rest)
}

/// Cast a literal only if no information is lost, e.g. 5i32 to 5i64 but not 1.5 to 1
fn cast_exact(value: &ScalarValue, data_type: &DataType) -> Option<ScalarValue> {
    if &value.data_type() == data_type {
        return Some(value.clone());
    }
    let cast = value.cast_to(data_type).ok()?;
    let back = cast.cast_to(&value.data_type()).ok()?;
    (&back == value).then_some(cast)
}

fn cast_condition(condition: FilterCondition, data_type: &DataType) -> Option<FilterCondition> {
    let bound = |b: Bound<ScalarValue>| -> Option<Bound<ScalarValue>> {
        Some(match b {
            Bound::Included(v) => Bound::Included(cast_exact(&v, data_type)?),
            Bound::Excluded(v) => Bound::Excluded(cast_exact(&v, data_type)?),
            Bound::Unbounded => Bound::Unbounded,
        })
    };
    Some(match condition {
        FilterCondition::Range { lower, upper } => FilterCondition::Range {
            lower: bound(lower)?,
            upper: bound(upper)?,
        },
        FilterCondition::Equals(v) => FilterCondition::Equals(cast_exact(&v, data_type)?),
        FilterCondition::IsIn(values) => FilterCondition::IsIn(
            values
                .iter()
                .map(|v| cast_exact(v, data_type))
                .collect::<Option<Vec<_>>>()?,
        ),
        other => other,
    })
}

/// Turns filters over output columns into a [`CompiledPredicate`]
#[derive(Debug)]
pub struct PredicateCompiler<'a> {
    projection: &'a ScanProjection,
    merge_duplicate_subfields: bool,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(projection: &'a ScanProjection) -> Self {
        Self {
            projection,
            merge_duplicate_subfields: false,
        }
    }

    /// AND together filters on the same subfield instead of failing
    pub fn with_merge_duplicate_subfields(mut self, merge: bool) -> Self {
        self.merge_duplicate_subfields = merge;
        self
    }

    /// Compile `filter` together with filters already expressed per subfield.
    ///
    /// Subfields of `subfield_filters` name output columns, like the columns of `filter`.
    pub fn compile(
        &self,
        filter: Option<Expr>,
        subfield_filters: Vec<(Subfield, FilterCondition)>,
    ) -> Result<CompiledPredicate> {
        let mut compiled = CompiledPredicate::default();
        for (subfield, condition) in subfield_filters {
            let name = subfield.to_string();
            let Some((subfield, condition)) = self.resolve(subfield, condition)? else {
                return Err(Error::invalid_input(
                    format!("Filter on {} cannot be pushed down", name),
                    location!(),
                ));
            };
            self.add(&mut compiled.filters, subfield, condition)?;
        }

        let mut residual = Vec::new();
        for conjunct in filter.map(Expr::into_conjuncts).unwrap_or_default() {
            match self.extract(&conjunct)? {
                Some((subfield, condition)) => {
                    log::trace!("Pushing down {} as a filter on {}", conjunct, subfield);
                    self.add(&mut compiled.filters, subfield, condition)?;
                }
                None => residual.push(conjunct),
            }
        }
        compiled.residual = Expr::conjunction(residual);
        Ok(compiled)
    }

    fn add(
        &self,
        filters: &mut SubfieldFilters,
        subfield: Subfield,
        condition: FilterCondition,
    ) -> Result<()> {
        match filters.remove(&subfield) {
            Some(existing) if self.merge_duplicate_subfields => {
                filters.insert(subfield, existing.merge_and(condition)?);
            }
            Some(_) => {
                return Err(Error::invalid_input(
                    format!("Duplicate filter on subfield {}", subfield),
                    location!(),
                ));
            }
            None => {
                filters.insert(subfield, condition);
            }
        }
        Ok(())
    }

    /// Map a subfield of an output column to its physical subfield and cast the literals.
    ///
    /// `None` when the column cannot take storage filters or a literal does not fit its type.
    fn resolve(
        &self,
        subfield: Subfield,
        condition: FilterCondition,
    ) -> Result<Option<(Subfield, FilterCondition)>> {
        let (_, handle) = self.projection.lookup(&subfield.root).ok_or_else(|| {
            Error::invalid_input(
                format!("Filter references unknown column {}", subfield.root),
                location!(),
            )
        })?;
        if !matches!(handle.kind, ColumnKind::Regular | ColumnKind::PartitionKey) {
            return Ok(None);
        }
        let data_type = subfield_type(&handle.data_type, &subfield.path)?;
        Ok(cast_condition(condition, &data_type)
            .map(|condition| (subfield.with_root(handle.physical_name.clone()), condition)))
    }

    fn extract(&self, conjunct: &Expr) -> Result<Option<(Subfield, FilterCondition)>> {
        let Some((target, condition)) = Self::as_condition(conjunct) else {
            return Ok(None);
        };
        let Some((root, path)) = target.as_subfield() else {
            return Ok(None);
        };
        self.resolve(Subfield { root, path }, condition)
    }

    /// The expression being tested and the condition it is tested with
    fn as_condition(conjunct: &Expr) -> Option<(&Expr, FilterCondition)> {
        match conjunct {
            Expr::Compare { op, left, right } => {
                let (target, op, value) = match (left.as_ref(), right.as_ref()) {
                    (target, Expr::Literal(value)) => (target, *op, value),
                    (Expr::Literal(value), target) => (target, op.flip(), value),
                    _ => return None,
                };
                if value.is_null() {
                    return None;
                }
                let value = value.clone();
                let condition = match op {
                    CompareOp::Eq => FilterCondition::Equals(value),
                    CompareOp::Lt => FilterCondition::range(Bound::Unbounded, Bound::Excluded(value)),
                    CompareOp::LtEq => {
                        FilterCondition::range(Bound::Unbounded, Bound::Included(value))
                    }
                    CompareOp::Gt => FilterCondition::range(Bound::Excluded(value), Bound::Unbounded),
                    CompareOp::GtEq => {
                        FilterCondition::range(Bound::Included(value), Bound::Unbounded)
                    }
                    CompareOp::NotEq => return None,
                };
                Some((target, condition))
            }
            Expr::Between { expr, low, high } if !low.is_null() && !high.is_null() => Some((
                expr.as_ref(),
                FilterCondition::range(Bound::Included(low.clone()), Bound::Included(high.clone())),
            )),
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                let values: Vec<ScalarValue> =
                    list.iter().filter(|v| !v.is_null()).cloned().collect();
                let condition = match values.len() {
                    0 => FilterCondition::AlwaysFalse,
                    _ => FilterCondition::IsIn(values),
                };
                Some((expr.as_ref(), condition))
            }
            Expr::IsNull(expr) => Some((expr.as_ref(), FilterCondition::IsNull)),
            Expr::IsNotNull(expr) => Some((expr.as_ref(), FilterCondition::IsNotNull)),
            Expr::Not(inner) => match inner.as_ref() {
                Expr::IsNull(expr) => Some((expr.as_ref(), FilterCondition::IsNotNull)),
                _ => None,
            },
            _ => None,
        }
    }
}
