// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Skipping of files and row groups based on their column statistics
//!
//! A unit (a file or one of its row groups) is skipped when its statistics prove
//! that no row can pass one of the pushed down filters. False negatives are fine,
//! false positives lose rows.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Bound;

use arrow_array::{Array, ArrayRef};
use arrow_select::concat::concat;
use datafusion_common::ScalarValue;
use strata_core::Result;

use crate::filter::{compare, FilterCondition, Subfield, SubfieldFilters};

/// Statistics of one column (or nested subfield) within a unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnStatistics {
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    pub null_count: Option<u64>,
}

impl ColumnStatistics {
    /// Compute the statistics of a column chunk
    pub fn from_array(array: &ArrayRef) -> Result<Self> {
        let null_count = array.null_count() as u64;
        let mut min: Option<ScalarValue> = None;
        let mut max: Option<ScalarValue> = None;
        for i in 0..array.len() {
            if array.is_null(i) {
                continue;
            }
            let value = ScalarValue::try_from_array(array, i)?;
            if min
                .as_ref()
                .is_none_or(|m| value.partial_cmp(m) == Some(Ordering::Less))
            {
                min = Some(value.clone());
            }
            if max
                .as_ref()
                .is_none_or(|m| value.partial_cmp(m) == Some(Ordering::Greater))
            {
                max = Some(value);
            }
        }
        Ok(Self {
            min,
            max,
            null_count: Some(null_count),
        })
    }

    /// Merge the statistics of several chunks of the same column
    pub fn merge(parts: &[&Self]) -> Self {
        let mut merged = Self {
            min: None,
            max: None,
            null_count: Some(0),
        };
        let mut first = true;
        for part in parts {
            merged.null_count = match (merged.null_count, part.null_count) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            };
            if first {
                merged.min = part.min.clone();
                merged.max = part.max.clone();
                first = false;
                continue;
            }
            merged.min = match (merged.min.take(), &part.min) {
                (Some(a), Some(b)) => Some(if b < &a { b.clone() } else { a }),
                _ => None,
            };
            merged.max = match (merged.max.take(), &part.max) {
                (Some(a), Some(b)) => Some(if b > &a { b.clone() } else { a }),
                _ => None,
            };
        }
        merged
    }

    /// The single value of a column whose min and max are equal
    pub fn constant_value(&self) -> Option<&ScalarValue> {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) if min == max => Some(min),
            _ => None,
        }
    }
}

/// Statistics of a file or row group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitStatistics {
    pub num_rows: u64,
    pub columns: HashMap<Subfield, ColumnStatistics>,
}

impl UnitStatistics {
    pub fn new(num_rows: u64) -> Self {
        Self {
            num_rows,
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, subfield: impl Into<Subfield>, stats: ColumnStatistics) -> Self {
        self.columns.insert(subfield.into(), stats);
        self
    }

    pub fn column(&self, subfield: &Subfield) -> Option<&ColumnStatistics> {
        self.columns.get(subfield)
    }

    /// Statistics of a whole file from those of its row groups
    pub fn merge(units: &[Self]) -> Self {
        let mut merged = Self::new(units.iter().map(|u| u.num_rows).sum());
        let Some(first) = units.first() else {
            return merged;
        };
        for subfield in first.columns.keys() {
            let parts = units
                .iter()
                .map(|u| u.column(subfield))
                .collect::<Option<Vec<_>>>();
            if let Some(parts) = parts {
                merged
                    .columns
                    .insert(subfield.clone(), ColumnStatistics::merge(&parts));
            }
        }
        merged
    }
}

/// Whether a value may exist that is `>= lower` given the unit's maximum
fn max_reaches(max: &ScalarValue, lower: &Bound<ScalarValue>) -> bool {
    match lower {
        Bound::Unbounded => true,
        Bound::Included(bound) => !matches!(compare(max, bound), Ok(Ordering::Less)),
        Bound::Excluded(bound) => {
            !matches!(compare(max, bound), Ok(Ordering::Less | Ordering::Equal))
        }
    }
}

fn min_reaches(min: &ScalarValue, upper: &Bound<ScalarValue>) -> bool {
    match upper {
        Bound::Unbounded => true,
        Bound::Included(bound) => !matches!(compare(min, bound), Ok(Ordering::Greater)),
        Bound::Excluded(bound) => {
            !matches!(compare(min, bound), Ok(Ordering::Greater | Ordering::Equal))
        }
    }
}

fn within(value: &ScalarValue, min: Option<&ScalarValue>, max: Option<&ScalarValue>) -> bool {
    let inclusive = |v: &ScalarValue| Bound::Included(v.clone());
    min.is_none_or(|min| min_reaches(min, &inclusive(value)))
        && max.is_none_or(|max| max_reaches(max, &inclusive(value)))
}

/// Whether a row of a unit with `stats` may pass `condition`
///
/// Anything the statistics cannot decide (missing values, incomparable types) may match.
pub fn may_match(condition: &FilterCondition, stats: &ColumnStatistics, num_rows: u64) -> bool {
    if num_rows == 0 {
        return false;
    }
    let all_null = stats.null_count == Some(num_rows);
    let has_nulls = stats.null_count != Some(0);
    match condition {
        FilterCondition::AlwaysFalse => return false,
        FilterCondition::IsNull => return has_nulls,
        FilterCondition::IsNotNull => return !all_null,
        _ => {}
    }
    if all_null {
        return false;
    }
    if let Some(value) = stats.constant_value() {
        // Every non-null value is `value`, so any condition can be tested exactly
        if let Ok(matched) = condition.test_scalar(value) {
            return matched;
        }
    }
    let (min, max) = (stats.min.as_ref(), stats.max.as_ref());
    match condition {
        FilterCondition::Range { lower, upper } => {
            max.is_none_or(|max| max_reaches(max, lower))
                && min.is_none_or(|min| min_reaches(min, upper))
        }
        FilterCondition::Equals(value) => within(value, min, max),
        FilterCondition::IsIn(values) => values.iter().any(|v| within(v, min, max)),
        FilterCondition::IsNull | FilterCondition::IsNotNull | FilterCondition::AlwaysFalse => {
            true
        }
    }
}

/// Whether no row of `unit` can pass all of `filters`
///
/// Each filter is checked on its own. Filters on columns without statistics never skip.
pub fn can_skip(unit: &UnitStatistics, filters: &SubfieldFilters) -> bool {
    filters.iter().any(|(subfield, condition)| {
        unit.column(subfield)
            .is_some_and(|stats| !may_match(condition, stats, unit.num_rows))
    })
}

#[derive(Debug)]
struct TrackedFilter {
    subfield: Subfield,
    condition: FilterCondition,
    hits: u64,
}

/// Stateful skipper for one scan
///
/// Keeps per-filter hit counts. With reordering enabled the filters that skipped
/// most often are consulted first. The decision is the same in any order.
#[derive(Debug)]
pub struct StatsSkipper {
    filters: Vec<TrackedFilter>,
    reorder: bool,
    consulted: u64,
}

impl StatsSkipper {
    pub fn new(filters: &SubfieldFilters, reorder: bool) -> Self {
        Self {
            filters: filters
                .iter()
                .map(|(subfield, condition)| TrackedFilter {
                    subfield: subfield.clone(),
                    condition: condition.clone(),
                    hits: 0,
                })
                .collect(),
            reorder,
            consulted: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// How many filter checks were made so far
    pub fn filters_consulted(&self) -> u64 {
        self.consulted
    }

    /// The subfields in the order they are consulted
    pub fn order(&self) -> Vec<&Subfield> {
        self.filters.iter().map(|f| &f.subfield).collect()
    }

    pub fn can_skip(&mut self, unit: &UnitStatistics) -> bool {
        let mut hit = None;
        for (i, filter) in self.filters.iter().enumerate() {
            let Some(stats) = unit.column(&filter.subfield) else {
                continue;
            };
            self.consulted += 1;
            if !may_match(&filter.condition, stats, unit.num_rows) {
                hit = Some(i);
                break;
            }
        }
        let Some(i) = hit else {
            return false;
        };
        self.filters[i].hits += 1;
        if self.reorder {
            // Stable, so ties keep their original order
            self.filters.sort_by(|a, b| b.hits.cmp(&a.hits));
        }
        true
    }

    /// Indices of the row groups that may contain matching rows
    ///
    /// A column that holds the same value in every row group is tested once for the
    /// whole file before looking at the row groups one by one.
    pub fn prune_row_groups(&mut self, row_groups: &[UnitStatistics]) -> Vec<usize> {
        if self.is_empty() {
            return (0..row_groups.len()).collect();
        }
        for filter in &self.filters {
            if let Some(value) = file_constant(row_groups, &filter.subfield) {
                self.consulted += 1;
                if matches!(filter.condition.test_scalar(&value), Ok(false)) {
                    log::debug!(
                        "Column {} is constant {} in every row group, skipping them all",
                        filter.subfield,
                        value
                    );
                    return vec![];
                }
            }
        }
        row_groups
            .iter()
            .enumerate()
            .filter(|(_, unit)| !self.can_skip(unit))
            .map(|(i, _)| i)
            .collect()
    }
}

/// The value of `subfield` when every row group holds it in every row
fn file_constant(row_groups: &[UnitStatistics], subfield: &Subfield) -> Option<ScalarValue> {
    let mut constant: Option<&ScalarValue> = None;
    for unit in row_groups {
        let stats = unit.column(subfield)?;
        if stats.null_count != Some(0) {
            return None;
        }
        let value = stats.constant_value()?;
        if constant.is_some_and(|c| c != value) {
            return None;
        }
        constant = Some(value);
    }
    constant.cloned()
}

/// Statistics of the concatenation of `chunks`
pub fn statistics_of(chunks: &[ArrayRef]) -> Result<ColumnStatistics> {
    let refs = chunks.iter().map(|c| c.as_ref()).collect::<Vec<_>>();
    let all = concat(&refs)?;
    ColumnStatistics::from_array(&all)
}
