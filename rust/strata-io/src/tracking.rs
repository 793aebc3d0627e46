// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Make assertions about IO operations issued by a scan.
//!
//! When testing code that performs IO, you will often want to make assertions
//! about the number of reads performed and the amount of data read. Scans also
//! report the same numbers as runtime statistics (storage read bytes, overread
//! bytes, I/O wait time).
//!
//! This module provides [`IoTracker`] which can be used to wrap any [`Reader`].
use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use strata_core::Result;

use crate::object_reader::{FileInfo, Reader};

#[derive(Debug, Default, Clone)]
pub struct IoTracker(Arc<Mutex<IoStats>>);

impl IoTracker {
    fn lock(&self) -> MutexGuard<'_, IoStats> {
        // A panic while holding the lock leaves plain counters behind, still usable
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stats accumulated since the last call
    pub fn incremental_stats(&self) -> IoStats {
        std::mem::take(&mut *self.lock())
    }

    /// Stats accumulated so far, without resetting them
    pub fn stats(&self) -> IoStats {
        self.lock().clone()
    }

    pub fn wrap(&self, target: Arc<dyn Reader>) -> Arc<dyn Reader> {
        Arc::new(TrackedReader {
            target,
            tracker: self.clone(),
        })
    }

    /// Record bytes that were read but not requested (e.g. gaps filled in by coalescing)
    pub fn record_overread(&self, bytes: u64) {
        self.lock().overread_bytes += bytes;
    }

    fn record_read(&self, path: &Path, range: Range<u64>, num_bytes: u64, wait: Duration) {
        let mut stats = self.lock();
        stats.read_iops += 1;
        stats.read_bytes += num_bytes;
        stats.wait_time += wait;
        stats.requests.push(IoRequestRecord {
            path: path.clone(),
            range,
        });
    }
}

#[derive(Debug, Default, Clone)]
pub struct IoStats {
    pub read_iops: u64,
    pub read_bytes: u64,
    pub overread_bytes: u64,
    /// Time spent waiting on reads, summed over all requests
    pub wait_time: Duration,
    pub requests: Vec<IoRequestRecord>,
}

impl IoStats {
    pub fn merge(&mut self, other: &Self) {
        self.read_iops += other.read_iops;
        self.read_bytes += other.read_bytes;
        self.overread_bytes += other.overread_bytes;
        self.wait_time += other.wait_time;
        self.requests.extend(other.requests.iter().cloned());
    }
}

/// Assertions on IO statistics.
/// assert_io_eq!(io_stats, read_iops, 1);
/// assert_io_eq!(io_stats, read_bytes, 0, "should be no data reads");
#[macro_export]
macro_rules! assert_io_eq {
    ($io_stats:expr, $field:ident, $expected:expr) => {
        assert_eq!(
            $io_stats.$field, $expected,
            "Expected {} to be {}, got {}. Requests: {:#?}",
            stringify!($field),
            $expected,
            $io_stats.$field,
            $io_stats.requests
        );
    };
    ($io_stats:expr, $field:ident, $expected:expr, $($arg:tt)+) => {
        assert_eq!(
            $io_stats.$field, $expected,
            "Expected {} to be {}, got {}. Requests: {:#?} {}",
            stringify!($field),
            $expected,
            $io_stats.$field,
            $io_stats.requests,
            format_args!($($arg)+)
        );
    };
}

#[macro_export]
macro_rules! assert_io_gt {
    ($io_stats:expr, $field:ident, $expected:expr) => {
        assert!(
            $io_stats.$field > $expected,
            "Expected {} to be > {}, got {}. Requests: {:#?}",
            stringify!($field),
            $expected,
            $io_stats.$field,
            $io_stats.requests
        );
    };
}

#[derive(Clone)]
pub struct IoRequestRecord {
    pub path: Path,
    pub range: Range<u64>,
}

impl std::fmt::Debug for IoRequestRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // For example: "IORequest(path="t/part-0", range=0..100)"
        write!(
            f,
            "IORequest(path=\"{}\", range={:?})",
            self.path, self.range
        )
    }
}

impl Display for IoStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read_iops={} read_bytes={} overread_bytes={} wait={:?}",
            self.read_iops, self.read_bytes, self.overread_bytes, self.wait_time
        )
    }
}

/// A [`Reader`] that reports every range read to an [`IoTracker`]
#[derive(Debug)]
pub struct TrackedReader {
    target: Arc<dyn Reader>,
    tracker: IoTracker,
}

#[async_trait]
impl Reader for TrackedReader {
    fn path(&self) -> &Path {
        self.target.path()
    }

    async fn info(&self) -> Result<FileInfo> {
        self.target.info().await
    }

    async fn get_range(&self, range: Range<u64>) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.target.get_range(range.clone()).await;
        if let Ok(bytes) = &result {
            self.tracker
                .record_read(self.path(), range, bytes.len() as u64, start.elapsed());
        }
        result
    }
}
