// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Scan configuration
//!
//! Defaults can be overridden process-wide through environment variables, which
//! are read once on first use.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use snafu::location;
use strata_core::{Error, Result};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!(
                    "Ignoring invalid value {:?} for environment variable {}",
                    value,
                    name
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub static DEFAULT_PREFERRED_BATCH_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_or("STRATA_PREFERRED_BATCH_BYTES", 10 * 1024 * 1024));

/// Rows per batch before anything is known about the width of a row
pub static DEFAULT_PREFERRED_BATCH_ROWS: LazyLock<usize> =
    LazyLock::new(|| env_or("STRATA_PREFERRED_BATCH_ROWS", 1024));

pub static DEFAULT_MAX_BATCH_ROWS: LazyLock<usize> =
    LazyLock::new(|| env_or("STRATA_MAX_BATCH_ROWS", 10_000));

pub static DEFAULT_MAX_SPLIT_PRELOADS: LazyLock<usize> =
    LazyLock::new(|| env_or("STRATA_MAX_SPLIT_PRELOADS", 2));

pub static DEFAULT_IO_PARALLELISM: LazyLock<usize> =
    LazyLock::new(|| env_or("STRATA_IO_PARALLELISM", 16));

/// Ranges closer than this are read with a single request
pub static DEFAULT_IO_COALESCE_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_or("STRATA_IO_COALESCE_BYTES", 1024 * 1024));

/// Options that control how a table scan reads its splits
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Target size of an output batch in bytes
    pub preferred_batch_bytes: u64,
    /// Rows per batch used until the width of a row has been measured.
    /// Capped by `max_batch_rows`.
    pub preferred_batch_rows: usize,
    /// Hard cap on rows per output batch
    pub max_batch_rows: usize,
    /// Wall-clock budget for a single call that produces a batch. `None` means unlimited.
    pub get_output_time_limit: Option<Duration>,
    /// How many splits may be opened ahead of the one being read
    pub max_split_preloads: usize,
    /// Number of concurrent I/O tasks (preloads and range reads)
    pub io_parallelism: usize,
    pub io_coalesce_bytes: u64,
    /// Consult the filters that skipped the most units first
    pub stats_filter_reorder: bool,
    /// Interpret timestamp partition values in the session time zone instead of UTC
    pub partition_timestamps_as_local: bool,
    pub session_time_zone: FixedOffset,
    /// Match output names to file columns ignoring case
    pub case_insensitive_column_names: bool,
    /// Treat a split whose file does not exist as empty instead of failing
    pub ignore_missing_files: bool,
    /// Check for cancellation every N batch steps inside a unit
    pub cancellation_check_interval: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            preferred_batch_bytes: *DEFAULT_PREFERRED_BATCH_BYTES,
            preferred_batch_rows: *DEFAULT_PREFERRED_BATCH_ROWS,
            max_batch_rows: *DEFAULT_MAX_BATCH_ROWS,
            get_output_time_limit: None,
            max_split_preloads: *DEFAULT_MAX_SPLIT_PRELOADS,
            io_parallelism: *DEFAULT_IO_PARALLELISM,
            io_coalesce_bytes: *DEFAULT_IO_COALESCE_BYTES,
            stats_filter_reorder: true,
            partition_timestamps_as_local: false,
            session_time_zone: utc(),
            case_insensitive_column_names: false,
            ignore_missing_files: false,
            cancellation_check_interval: 1,
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl ScanConfig {
    pub fn with_preferred_batch_bytes(mut self, bytes: u64) -> Self {
        self.preferred_batch_bytes = bytes;
        self
    }

    pub fn with_preferred_batch_rows(mut self, rows: usize) -> Self {
        self.preferred_batch_rows = rows;
        self
    }

    /// The maximum number of rows per batch
    ///
    /// Batches can be smaller because of the byte budget, filtering, or because the
    /// end of a storage unit was reached (batches never span units).
    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = rows;
        self
    }

    pub fn with_get_output_time_limit(mut self, limit: Duration) -> Self {
        self.get_output_time_limit = Some(limit);
        self
    }

    /// Controls how many splits to open ahead of the current one.
    ///
    /// Zero disables preloading. Preloads only ever use free slots of the I/O
    /// executor, a busy executor means fewer (or no) preloads.
    pub fn with_max_split_preloads(mut self, preloads: usize) -> Self {
        self.max_split_preloads = preloads;
        self
    }

    pub fn with_io_parallelism(mut self, parallelism: usize) -> Self {
        self.io_parallelism = parallelism;
        self
    }

    pub fn with_io_coalesce_bytes(mut self, bytes: u64) -> Self {
        self.io_coalesce_bytes = bytes;
        self
    }

    pub fn with_stats_filter_reorder(mut self, enabled: bool) -> Self {
        self.stats_filter_reorder = enabled;
        self
    }

    pub fn with_partition_timestamps_as_local(mut self, time_zone: FixedOffset) -> Self {
        self.partition_timestamps_as_local = true;
        self.session_time_zone = time_zone;
        self
    }

    pub fn with_case_insensitive_column_names(mut self, enabled: bool) -> Self {
        self.case_insensitive_column_names = enabled;
        self
    }

    pub fn with_ignore_missing_files(mut self, enabled: bool) -> Self {
        self.ignore_missing_files = enabled;
        self
    }

    pub fn with_cancellation_check_interval(mut self, interval: usize) -> Self {
        self.cancellation_check_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.preferred_batch_bytes == 0 {
            return Err(Error::InvalidInput {
                source: "preferred_batch_bytes must be greater than zero".into(),
                location: location!(),
            });
        }
        if self.max_batch_rows == 0 {
            return Err(Error::InvalidInput {
                source: "max_batch_rows must be greater than zero".into(),
                location: location!(),
            });
        }
        if self.preferred_batch_rows == 0 {
            return Err(Error::InvalidInput {
                source: "preferred_batch_rows must be greater than zero".into(),
                location: location!(),
            });
        }
        if self.io_parallelism == 0 {
            return Err(Error::InvalidInput {
                source: "io_parallelism must be greater than zero".into(),
                location: location!(),
            });
        }
        if self.cancellation_check_interval == 0 {
            return Err(Error::InvalidInput {
                source: "cancellation_check_interval must be greater than zero".into(),
                location: location!(),
            });
        }
        Ok(())
    }
}
