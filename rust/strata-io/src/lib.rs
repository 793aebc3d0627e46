// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors
use std::ops::Range;

use arrow_array::{Array, BooleanArray, UInt32Array};

pub mod object_reader;
pub mod scheduler;
pub mod stream;
pub mod tracking;

/// Defines a selection of rows within one storage unit (a row group or a batch)
///
/// Offsets are relative to the start of the unit and always ascending.
#[derive(Debug, Clone)]
pub enum RowSelection {
    /// Select a contiguous range of rows
    Range(Range<usize>),
    /// Select scattered non-contiguous rows
    Indices(UInt32Array),
}

impl Default for RowSelection {
    fn default() -> Self {
        Self::Range(0..0)
    }
}

impl From<&[u32]> for RowSelection {
    fn from(value: &[u32]) -> Self {
        Self::Indices(UInt32Array::from_iter_values(value.iter().copied()))
    }
}

impl From<Vec<u32>> for RowSelection {
    fn from(value: Vec<u32>) -> Self {
        Self::Indices(UInt32Array::from(value))
    }
}

impl From<UInt32Array> for RowSelection {
    fn from(value: UInt32Array) -> Self {
        Self::Indices(value)
    }
}

impl From<Range<usize>> for RowSelection {
    fn from(r: Range<usize>) -> Self {
        Self::Range(r)
    }
}

/// Two selections are equal if they select the same rows, regardless of representation
impl PartialEq for RowSelection {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Range(a), Self::Range(b)) => a == b || (a.is_empty() && b.is_empty()),
            _ => self.len() == other.len() && self.iter().eq(other.iter()),
        }
    }
}

impl RowSelection {
    /// Select all `num_rows` rows of a unit
    pub fn all(num_rows: usize) -> Self {
        Self::Range(0..num_rows)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Range(r) => r.len(),
            Self::Indices(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Self::Range(r) => Box::new(r.clone().map(|v| v as u32)),
            Self::Indices(indices) => Box::new(indices.values().iter().copied()),
        }
    }

    pub fn to_indices(&self) -> UInt32Array {
        match self {
            Self::Indices(indices) => indices.clone(),
            Self::Range(r) => UInt32Array::from_iter_values(r.clone().map(|v| v as u32)),
        }
    }

    /// Keep the rows for which `mask` is true
    ///
    /// `mask` is positional: entry `i` refers to the i-th selected row. Nulls count as false.
    pub fn filter(&self, mask: &BooleanArray) -> Self {
        debug_assert_eq!(mask.len(), self.len());
        if mask.null_count() == 0 && mask.true_count() == mask.len() {
            return self.clone();
        }
        let kept = self
            .iter()
            .zip(mask.iter())
            .filter_map(|(row, keep)| keep.unwrap_or(false).then_some(row));
        Self::Indices(UInt32Array::from_iter_values(kept))
    }

    /// Returns true if every row of `self` is also selected by `other`
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.positions_in(other).is_some()
    }

    /// The positions of this selection's rows inside `superset`
    ///
    /// Returns `None` if some row of `self` is not selected by `superset`.
    pub fn positions_in(&self, superset: &Self) -> Option<UInt32Array> {
        match superset {
            Self::Range(r) => {
                let mut positions = Vec::with_capacity(self.len());
                for row in self.iter() {
                    let row = row as usize;
                    if !r.contains(&row) {
                        return None;
                    }
                    positions.push((row - r.start) as u32);
                }
                Some(UInt32Array::from(positions))
            }
            Self::Indices(indices) => {
                let values = indices.values();
                let mut positions = Vec::with_capacity(self.len());
                // Both sides are ascending so a single merge pass is enough
                let mut cursor = 0;
                for row in self.iter() {
                    while cursor < values.len() && values[cursor] < row {
                        cursor += 1;
                    }
                    if cursor == values.len() || values[cursor] != row {
                        return None;
                    }
                    positions.push(cursor as u32);
                }
                Some(UInt32Array::from(positions))
            }
        }
    }
}
