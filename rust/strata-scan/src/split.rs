// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use object_store::path::Path;

/// Properties used to build the row id column of a split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdProperties {
    pub metadata_version: i64,
    pub partition_id: i64,
    pub table_guid: String,
}

/// One unit of scan work: a byte range of a file plus the metadata needed to
/// synthesize its constant columns.
///
/// A row group belongs to the split whose byte range contains the row group's
/// first byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub path: Path,
    pub start: u64,
    pub length: u64,
    /// Size of the file if the caller already knows it
    pub file_size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
    /// Partition key name to its (unparsed) value. `None` is the null partition.
    pub partition_keys: BTreeMap<String, Option<String>>,
    pub bucket: Option<i32>,
    pub row_id: Option<RowIdProperties>,
    /// Whether reads of this split may populate the shared cache
    pub cacheable: bool,
    /// Scheduling weight, see [`crate::scheduler::SplitStats`]
    pub weight: u64,
}

impl Split {
    /// A split covering the whole file
    pub fn new(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            start: 0,
            length: u64::MAX,
            file_size: None,
            modified_time: None,
            partition_keys: BTreeMap::new(),
            bucket: None,
            row_id: None,
            cacheable: true,
            weight: 1,
        }
    }

    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.start = range.start;
        self.length = range.end.saturating_sub(range.start);
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_modified_time(mut self, time: DateTime<Utc>) -> Self {
        self.modified_time = Some(time);
        self
    }

    pub fn with_partition_key(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.partition_keys
            .insert(name.into(), value.map(|v| v.to_string()));
        self
    }

    pub fn with_bucket(mut self, bucket: i32) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_row_id(mut self, properties: RowIdProperties) -> Self {
        self.row_id = Some(properties);
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    /// The byte range of the split, clipped so it never overflows
    pub fn byte_range(&self) -> Range<u64> {
        self.start..self.start.saturating_add(self.length)
    }

    /// Whether a row group starting at `offset` belongs to this split
    pub fn owns_offset(&self, offset: u64) -> bool {
        self.byte_range().contains(&offset)
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.length == u64::MAX {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}[{}..{}]", self.path, self.start, self.start + self.length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_range() {
        let split = Split::new("t/part-0");
        assert!(split.owns_offset(0));
        assert!(split.owns_offset(u64::MAX - 1));
        assert_eq!(split.to_string(), "t/part-0");

        let split = Split::new("t/part-0").with_range(100..200);
        assert!(!split.owns_offset(99));
        assert!(split.owns_offset(100));
        assert!(!split.owns_offset(200));
        assert_eq!(split.to_string(), "t/part-0[100..200]");
    }
}
