// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! The interface a file format implements to be scanned
//!
//! A format opens one split at a time. Opening reads the footer, which is enough
//! to know the schema, the file level statistics and where the row groups are.
//! Row group statistics are a second read that only happens when some filter
//! could use them.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use async_trait::async_trait;
use object_store::path::Path;
use strata_core::cache::{Retention, ScanCache};
use strata_core::Result;
use strata_io::object_reader::FileInfo;
use strata_io::scheduler::{CoalescingReader, IoExecutor};
use strata_io::tracking::IoTracker;
use strata_io::RowSelection;

use crate::filter::SubfieldFilters;
use crate::lazy::ColumnLoader;
use crate::split::Split;
use crate::stats::UnitStatistics;

/// What a format needs to read a split
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub executor: Arc<IoExecutor>,
    pub cache: ScanCache,
    pub retention: Retention,
    pub tracker: IoTracker,
    /// Ranges closer than this are read with one request
    pub coalesce_bytes: u64,
}

impl OpenOptions {
    pub fn new(executor: Arc<IoExecutor>, cache: ScanCache) -> Self {
        Self {
            executor,
            cache,
            retention: Retention::Retain,
            tracker: IoTracker::default(),
            coalesce_bytes: 0,
        }
    }

    /// A [`CoalescingReader`] over `reader` with these options
    pub fn coalescing_reader(
        &self,
        reader: Arc<dyn strata_io::object_reader::Reader>,
    ) -> CoalescingReader {
        CoalescingReader::new(
            self.tracker.wrap(reader),
            self.executor.clone(),
            self.cache.clone(),
        )
        .with_max_gap(self.coalesce_bytes)
        .with_retention(self.retention)
        .with_tracker(self.tracker.clone())
    }
}

/// Location of a row group within its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGroupInfo {
    /// Index in the file
    pub index: usize,
    /// Byte offset where the row group starts
    pub offset: u64,
    pub num_rows: usize,
    /// Ordinal of the first row within the file
    pub first_row: u64,
}

/// The rows of part of a row group that passed the pushed down filters
#[derive(Debug)]
pub struct UnitRead {
    /// Offsets within the rows that were read
    pub passing: RowSelection,
    /// One loader per requested column, empty when no row passed
    pub columns: Vec<Arc<dyn ColumnLoader>>,
}

/// Opens splits of one file format
#[async_trait]
pub trait FileFormat: Debug + Send + Sync {
    /// Open the file of `split` and read its footer
    ///
    /// A file that does not exist is reported as [`strata_core::Error::NotFound`].
    async fn open_split(&self, split: &Split, options: OpenOptions) -> Result<Box<dyn SplitReader>>;
}

/// An opened split
#[async_trait]
pub trait SplitReader: Debug + Send + Sync {
    fn path(&self) -> &Path;

    fn file_schema(&self) -> SchemaRef;

    fn file_info(&self) -> FileInfo;

    /// Statistics of the whole file, if the footer has them
    fn file_statistics(&self) -> Option<&UnitStatistics>;

    /// The row groups that start inside the split's byte range, in file order
    fn row_groups(&self) -> &[RowGroupInfo];

    /// Statistics of each row group of [`Self::row_groups`]
    async fn row_group_statistics(&self) -> Result<Vec<UnitStatistics>>;

    /// Read `rows` of a row group (by position in [`Self::row_groups`])
    ///
    /// `filters` are keyed by file column names and must all pass for a row to be
    /// in [`UnitRead::passing`]. The loaders cover `rows`, offsets are relative to
    /// `rows.start`.
    async fn read_rows(
        &self,
        row_group: usize,
        rows: Range<usize>,
        columns: &[String],
        filters: &SubfieldFilters,
    ) -> Result<UnitRead>;
}
