// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Column level filters that can be pushed to storage
//!
//! A [`FilterCondition`] is a range, equality, set membership or null test on
//! one [`Subfield`] (a column or a path into a nested column). Conditions on
//! the same subfield are combined by AND, never replaced.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::Bound;

use arrow_arith::boolean::{and, is_not_null, is_null, or};
use arrow_array::cast::AsArray;
use arrow_array::{make_array, Array, ArrayRef, BooleanArray, UInt32Array};
use arrow_buffer::NullBuffer;
use arrow_ord::cmp;
use arrow_schema::DataType;
use datafusion_common::ScalarValue;
use snafu::location;
use strata_core::{Error, Result};

/// One step of a path into a nested column
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathElement {
    /// A struct field
    NestedField(String),
    /// A list element, 1-based
    LongSubscript(i64),
    /// The value of a map entry with a string key
    StringSubscript(String),
}

/// A column, or a path into a nested column
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subfield {
    pub root: String,
    pub path: Vec<PathElement>,
}

impl Subfield {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: vec![],
        }
    }

    pub fn with_element(mut self, element: PathElement) -> Self {
        self.path.push(element);
        self
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// The same path starting from another column
    pub fn with_root(&self, root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: self.path.clone(),
        }
    }
}

impl From<&str> for Subfield {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Display for Subfield {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root)?;
        for element in &self.path {
            match element {
                PathElement::NestedField(name) => write!(f, ".{}", name)?,
                PathElement::LongSubscript(index) => write!(f, "[{}]", index)?,
                PathElement::StringSubscript(key) => write!(f, "[\"{}\"]", key)?,
            }
        }
        Ok(())
    }
}

/// A predicate on the values of one subfield.
///
/// Every condition except `IsNull` rejects null values.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Range {
        lower: Bound<ScalarValue>,
        upper: Bound<ScalarValue>,
    },
    Equals(ScalarValue),
    IsIn(Vec<ScalarValue>),
    IsNull,
    IsNotNull,
    /// Matches nothing, the result of merging contradicting conditions
    AlwaysFalse,
}

pub type SubfieldFilters = BTreeMap<Subfield, FilterCondition>;

pub(crate) fn compare(a: &ScalarValue, b: &ScalarValue) -> Result<Ordering> {
    a.partial_cmp(b).ok_or_else(|| {
        Error::internal(
            format!("Cannot compare {} with {}", a.data_type(), b.data_type()),
            location!(),
        )
    })
}

fn satisfies_lower(value: &ScalarValue, lower: &Bound<ScalarValue>) -> Result<bool> {
    Ok(match lower {
        Bound::Unbounded => true,
        Bound::Included(bound) => compare(value, bound)? != Ordering::Less,
        Bound::Excluded(bound) => compare(value, bound)? == Ordering::Greater,
    })
}

fn satisfies_upper(value: &ScalarValue, upper: &Bound<ScalarValue>) -> Result<bool> {
    Ok(match upper {
        Bound::Unbounded => true,
        Bound::Included(bound) => compare(value, bound)? != Ordering::Greater,
        Bound::Excluded(bound) => compare(value, bound)? == Ordering::Less,
    })
}

/// The tighter of two bounds. `prefer` is the ordering of the value that wins.
fn tighter(
    a: Bound<ScalarValue>,
    b: Bound<ScalarValue>,
    prefer: Ordering,
) -> Result<Bound<ScalarValue>> {
    let ordering = match (&a, &b) {
        (Bound::Unbounded, _) => return Ok(b),
        (_, Bound::Unbounded) => return Ok(a),
        (
            Bound::Included(va) | Bound::Excluded(va),
            Bound::Included(vb) | Bound::Excluded(vb),
        ) => compare(va, vb)?,
    };
    Ok(if ordering == prefer {
        a
    } else if ordering == prefer.reverse() {
        b
    } else if matches!(a, Bound::Excluded(_)) {
        // Same value: exclusive is tighter
        a
    } else {
        b
    })
}

fn range_is_empty(lower: &Bound<ScalarValue>, upper: &Bound<ScalarValue>) -> Result<bool> {
    Ok(match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => compare(l, u)? == Ordering::Greater,
        (
            Bound::Included(l) | Bound::Excluded(l),
            Bound::Included(u) | Bound::Excluded(u),
        ) => compare(l, u)? != Ordering::Less,
        _ => false,
    })
}

impl FilterCondition {
    pub fn range(lower: Bound<ScalarValue>, upper: Bound<ScalarValue>) -> Self {
        Self::Range { lower, upper }
    }

    /// Whether the condition accepts null values
    pub fn accepts_null(&self) -> bool {
        matches!(self, Self::IsNull)
    }

    /// Whether the condition can only pass non-null values
    pub fn is_value_filter(&self) -> bool {
        matches!(self, Self::Range { .. } | Self::Equals(_) | Self::IsIn(_))
    }

    /// Test one value
    pub fn test_scalar(&self, value: &ScalarValue) -> Result<bool> {
        if value.is_null() {
            return Ok(self.accepts_null());
        }
        Ok(match self {
            Self::Range { lower, upper } => {
                satisfies_lower(value, lower)? && satisfies_upper(value, upper)?
            }
            Self::Equals(expected) => compare(value, expected)? == Ordering::Equal,
            Self::IsIn(values) => {
                let mut found = false;
                for candidate in values {
                    if compare(value, candidate)? == Ordering::Equal {
                        found = true;
                        break;
                    }
                }
                found
            }
            Self::IsNull | Self::AlwaysFalse => false,
            Self::IsNotNull => true,
        })
    }

    fn keep_values(values: Vec<ScalarValue>, other: &Self) -> Result<Self> {
        let mut kept = Vec::with_capacity(values.len());
        for value in values {
            if other.test_scalar(&value)? {
                kept.push(value);
            }
        }
        Ok(match kept.len() {
            0 => Self::AlwaysFalse,
            1 => Self::Equals(kept.remove(0)),
            _ => Self::IsIn(kept),
        })
    }

    /// Combine two conditions on the same subfield into one that passes the rows both pass
    pub fn merge_and(self, other: Self) -> Result<Self> {
        Ok(match (self, other) {
            (Self::AlwaysFalse, _) | (_, Self::AlwaysFalse) => Self::AlwaysFalse,
            (Self::IsNull, Self::IsNull) => Self::IsNull,
            (Self::IsNull, _) | (_, Self::IsNull) => Self::AlwaysFalse,
            (Self::IsNotNull, other) | (other, Self::IsNotNull) => other,
            (Self::Equals(value), other) | (other, Self::Equals(value)) => {
                Self::keep_values(vec![value], &other)?
            }
            (Self::IsIn(values), other) | (other, Self::IsIn(values)) => {
                Self::keep_values(values, &other)?
            }
            (
                Self::Range {
                    lower: l1,
                    upper: u1,
                },
                Self::Range {
                    lower: l2,
                    upper: u2,
                },
            ) => {
                let lower = tighter(l1, l2, Ordering::Greater)?;
                let upper = tighter(u1, u2, Ordering::Less)?;
                if range_is_empty(&lower, &upper)? {
                    Self::AlwaysFalse
                } else {
                    Self::Range { lower, upper }
                }
            }
        })
    }

    /// Evaluate the condition on every value of `array`
    ///
    /// Null results are possible, callers treat them as false.
    pub fn evaluate(&self, array: &dyn Array) -> Result<BooleanArray> {
        let combine = |acc: Option<BooleanArray>, next: BooleanArray| -> Result<BooleanArray> {
            match acc {
                Some(acc) => Ok(and(&acc, &next)?),
                None => Ok(next),
            }
        };
        match self {
            Self::Range { lower, upper } => {
                let mut result = None;
                match lower {
                    Bound::Included(v) => {
                        result = Some(cmp::gt_eq(&array, &v.to_scalar()?)?);
                    }
                    Bound::Excluded(v) => result = Some(cmp::gt(&array, &v.to_scalar()?)?),
                    Bound::Unbounded => {}
                }
                match upper {
                    Bound::Included(v) => {
                        result = Some(combine(result, cmp::lt_eq(&array, &v.to_scalar()?)?)?);
                    }
                    Bound::Excluded(v) => {
                        result = Some(combine(result, cmp::lt(&array, &v.to_scalar()?)?)?);
                    }
                    Bound::Unbounded => {}
                }
                match result {
                    Some(result) => Ok(result),
                    None => Ok(is_not_null(array)?),
                }
            }
            Self::Equals(v) => Ok(cmp::eq(&array, &v.to_scalar()?)?),
            Self::IsIn(values) => {
                let mut result: Option<BooleanArray> = None;
                for value in values {
                    let matches = cmp::eq(&array, &value.to_scalar()?)?;
                    result = Some(match result {
                        Some(acc) => or(&acc, &matches)?,
                        None => matches,
                    });
                }
                Ok(result.unwrap_or_else(|| BooleanArray::from(vec![false; array.len()])))
            }
            Self::IsNull => Ok(is_null(array)?),
            Self::IsNotNull => Ok(is_not_null(array)?),
            Self::AlwaysFalse => Ok(BooleanArray::from(vec![false; array.len()])),
        }
    }

    /// Cast every literal of the condition to `data_type`
    pub fn cast_to(self, data_type: &DataType) -> Result<Self> {
        let cast = |v: ScalarValue| -> Result<ScalarValue> { Ok(v.cast_to(data_type)?) };
        let cast_bound = |b: Bound<ScalarValue>| -> Result<Bound<ScalarValue>> {
            Ok(match b {
                Bound::Included(v) => Bound::Included(cast(v)?),
                Bound::Excluded(v) => Bound::Excluded(cast(v)?),
                Bound::Unbounded => Bound::Unbounded,
            })
        };
        Ok(match self {
            Self::Range { lower, upper } => Self::Range {
                lower: cast_bound(lower)?,
                upper: cast_bound(upper)?,
            },
            Self::Equals(v) => Self::Equals(cast(v)?),
            Self::IsIn(values) => {
                Self::IsIn(values.into_iter().map(cast).collect::<Result<Vec<_>>>()?)
            }
            other => other,
        })
    }
}

/// AND `condition` into the filter already registered for `subfield`, if any
pub fn merge_filter(
    filters: &mut SubfieldFilters,
    subfield: Subfield,
    condition: FilterCondition,
) -> Result<()> {
    let merged = match filters.remove(&subfield) {
        Some(existing) => existing.merge_and(condition)?,
        None => condition,
    };
    filters.insert(subfield, merged);
    Ok(())
}

/// Combine the validity of a parent with its child
fn with_parent_nulls(child: &ArrayRef, parent: Option<&NullBuffer>) -> Result<ArrayRef> {
    let Some(parent) = parent else {
        return Ok(child.clone());
    };
    let nulls = NullBuffer::union(Some(parent), child.nulls());
    let data = child.to_data().into_builder().nulls(nulls).build()?;
    Ok(make_array(data))
}

/// Extract the values a subfield path points at, one per row of `array`.
///
/// Rows where the path does not exist (null parent, short list, missing map
/// key) are null.
pub fn extract_subfield(array: &ArrayRef, path: &[PathElement]) -> Result<ArrayRef> {
    let Some((element, rest)) = path.split_first() else {
        return Ok(array.clone());
    };
    let child = match (element, array.data_type()) {
        (PathElement::NestedField(name), DataType::Struct(_)) => {
            let structs = array.as_struct();
            let child = structs.column_by_name(name).ok_or_else(|| {
                Error::invalid_input(format!("No struct field named {}", name), location!())
            })?;
            with_parent_nulls(child, structs.nulls())?
        }
        (PathElement::LongSubscript(index), DataType::List(_)) => {
            let lists = array.as_list::<i32>();
            let offsets = lists.value_offsets();
            let indices: UInt32Array = (0..lists.len())
                .map(|row| {
                    let len = (offsets[row + 1] - offsets[row]) as i64;
                    (lists.is_valid(row) && *index >= 1 && *index <= len)
                        .then(|| (offsets[row] as i64 + index - 1) as u32)
                })
                .collect();
            arrow_select::take::take(lists.values().as_ref(), &indices, None)?
        }
        (PathElement::StringSubscript(key), DataType::Map(_, _)) => {
            let maps = array.as_map();
            let keys = maps.keys();
            let keys = keys.as_string_opt::<i32>().ok_or_else(|| {
                Error::not_supported("Only maps with Utf8 keys can be subscripted", location!())
            })?;
            let offsets = maps.value_offsets();
            let indices: UInt32Array = (0..maps.len())
                .map(|row| {
                    if !maps.is_valid(row) {
                        return None;
                    }
                    (offsets[row]..offsets[row + 1])
                        .map(|entry| entry as usize)
                        .find(|&entry| keys.is_valid(entry) && keys.value(entry) == key)
                        .map(|entry| entry as u32)
                })
                .collect();
            arrow_select::take::take(maps.values().as_ref(), &indices, None)?
        }
        (element, data_type) => {
            return Err(Error::invalid_input(
                format!("Cannot apply {:?} to a column of type {}", element, data_type),
                location!(),
            ));
        }
    };
    extract_subfield(&child, rest)
}
