// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Runtime statistics of a table scan
//!
//! The metric names are stable, tooling keys off of them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use strata_io::tracking::IoStats;

pub const RAW_INPUT_ROWS_METRIC: &str = "raw_input_rows";
pub const RAW_INPUT_BYTES_METRIC: &str = "raw_input_bytes";
pub const INPUT_ROWS_METRIC: &str = "input_rows";
pub const OUTPUT_ROWS_METRIC: &str = "output_rows";
pub const SKIPPED_SPLITS_METRIC: &str = "skipped_splits";
pub const SKIPPED_STRIDES_METRIC: &str = "skipped_strides";
pub const PRELOADED_SPLITS_METRIC: &str = "preloaded_splits";
pub const STORAGE_READ_BYTES_METRIC: &str = "storage_read_bytes";
pub const OVERREAD_BYTES_METRIC: &str = "overread_bytes";
pub const IO_WAIT_NANOS_METRIC: &str = "io_wait_nanos";
pub const TOTAL_SCAN_TIME_METRIC: &str = "total_scan_time_nanos";
pub const AGGREGATION_PUSHDOWN_ROWS_METRIC: &str = "aggregation_pushdown_rows";
pub const PROCESSED_SPLITS_METRIC: &str = "processed_splits";
pub const YIELD_COUNT_METRIC: &str = "yield_count";
pub const MISSING_FILES_METRIC: &str = "missing_files";

/// Counters shared by the operator, its data sources and their preload tasks
#[derive(Debug, Default)]
pub struct ScanMetrics {
    /// Rows read from storage units, before any filter
    pub raw_input_rows: AtomicU64,
    pub raw_input_bytes: AtomicU64,
    /// Rows that passed the pushed down filters, before the residual filter
    pub input_rows: AtomicU64,
    /// Rows that passed every filter
    pub output_rows: AtomicU64,
    /// Splits skipped as a whole (partition pruning or file statistics)
    pub skipped_splits: AtomicU64,
    /// Row groups skipped because of their statistics
    pub skipped_strides: AtomicU64,
    pub preloaded_splits: AtomicU64,
    pub storage_read_bytes: AtomicU64,
    pub overread_bytes: AtomicU64,
    pub io_wait_nanos: AtomicU64,
    pub total_scan_time_nanos: AtomicU64,
    pub aggregation_pushdown_rows: AtomicU64,
    pub processed_splits: AtomicU64,
    pub yield_count: AtomicU64,
    pub missing_files: AtomicU64,
}

impl ScanMetrics {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn add_duration(counter: &AtomicU64, value: Duration) {
        counter.fetch_add(value.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Fold the I/O done by one reader into the scan totals
    pub fn record_io(&self, io: &IoStats) {
        Self::add(&self.storage_read_bytes, io.read_bytes);
        Self::add(&self.overread_bytes, io.overread_bytes);
        Self::add_duration(&self.io_wait_nanos, io.wait_time);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// A point in time copy of every counter, keyed by metric name
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        [
            (RAW_INPUT_ROWS_METRIC, &self.raw_input_rows),
            (RAW_INPUT_BYTES_METRIC, &self.raw_input_bytes),
            (INPUT_ROWS_METRIC, &self.input_rows),
            (OUTPUT_ROWS_METRIC, &self.output_rows),
            (SKIPPED_SPLITS_METRIC, &self.skipped_splits),
            (SKIPPED_STRIDES_METRIC, &self.skipped_strides),
            (PRELOADED_SPLITS_METRIC, &self.preloaded_splits),
            (STORAGE_READ_BYTES_METRIC, &self.storage_read_bytes),
            (OVERREAD_BYTES_METRIC, &self.overread_bytes),
            (IO_WAIT_NANOS_METRIC, &self.io_wait_nanos),
            (TOTAL_SCAN_TIME_METRIC, &self.total_scan_time_nanos),
            (AGGREGATION_PUSHDOWN_ROWS_METRIC, &self.aggregation_pushdown_rows),
            (PROCESSED_SPLITS_METRIC, &self.processed_splits),
            (YIELD_COUNT_METRIC, &self.yield_count),
            (MISSING_FILES_METRIC, &self.missing_files),
        ]
        .into_iter()
        .map(|(name, counter)| (name, Self::get(counter)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_names() {
        let metrics = ScanMetrics::default();
        ScanMetrics::add(&metrics.raw_input_rows, 10);
        ScanMetrics::add(&metrics.output_rows, 3);
        metrics.record_io(&IoStats {
            read_iops: 2,
            read_bytes: 100,
            overread_bytes: 7,
            wait_time: Duration::from_nanos(50),
            requests: vec![],
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 15);
        assert_eq!(snapshot[RAW_INPUT_ROWS_METRIC], 10);
        assert_eq!(snapshot[OUTPUT_ROWS_METRIC], 3);
        assert_eq!(snapshot[STORAGE_READ_BYTES_METRIC], 100);
        assert_eq!(snapshot[OVERREAD_BYTES_METRIC], 7);
        assert_eq!(snapshot[IO_WAIT_NANOS_METRIC], 50);
        assert_eq!(snapshot["skipped_strides"], 0);
    }
}
