// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Output batch sizing and the per-call time budget

use std::time::{Duration, Instant};

use crate::config::ScanConfig;

/// The number of rows that fit `preferred_bytes` at `avg_row_bytes` per row, within `[1, max_rows]`
pub fn next_target_row_count(avg_row_bytes: u64, preferred_bytes: u64, max_rows: usize) -> usize {
    let rows = preferred_bytes / avg_row_bytes.max(1);
    usize::try_from(rows).unwrap_or(usize::MAX).clamp(1, max_rows.max(1))
}

/// Picks how many rows to read for the next batch
///
/// The row width estimate is a running average over every non-empty batch produced
/// so far. After a batch that was filtered out entirely the target grows from the
/// previous one instead of jumping to what the byte budget allows.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    preferred_bytes: u64,
    initial_rows: usize,
    max_rows: usize,
    time_limit: Option<Duration>,
    total_bytes: u64,
    total_rows: u64,
    width_hint: Option<u64>,
    last_target: Option<usize>,
    last_empty: bool,
    call_started: Option<Instant>,
}

impl BatchSizer {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            preferred_bytes: config.preferred_batch_bytes,
            initial_rows: config.preferred_batch_rows.min(config.max_batch_rows),
            max_rows: config.max_batch_rows,
            time_limit: config.get_output_time_limit,
            total_bytes: 0,
            total_rows: 0,
            width_hint: None,
            last_target: None,
            last_empty: false,
            call_started: None,
        }
    }

    /// Average bytes per output row seen so far
    pub fn average_row_bytes(&self) -> Option<u64> {
        (self.total_rows > 0).then(|| self.total_bytes.div_ceil(self.total_rows))
    }

    /// A row width estimate from the reader, used until a batch has been measured
    pub fn hint_row_bytes(&mut self, bytes: u64) {
        if bytes > 0 {
            self.width_hint = Some(bytes);
        }
    }

    /// Rows to read next from a unit with `remaining` rows left
    pub fn next_batch_rows(&mut self, remaining: usize) -> usize {
        let budget = match self.average_row_bytes().or(self.width_hint) {
            Some(width) => next_target_row_count(width, self.preferred_bytes, self.max_rows),
            None => self.initial_rows,
        };
        let target = match self.last_target {
            Some(last) if self.last_empty => last.saturating_mul(2).min(budget),
            _ => budget,
        };
        let target = target.min(remaining).max(1);
        if self.last_target != Some(target) {
            log::trace!(
                "Batch target {} rows (average row width {:?})",
                target,
                self.average_row_bytes()
            );
        }
        self.last_target = Some(target);
        target
    }

    /// Feed back the size of the batch produced from the last target
    pub fn record_batch(&mut self, output_rows: usize, output_bytes: u64) {
        if output_rows == 0 {
            self.last_empty = true;
            return;
        }
        self.last_empty = false;
        self.total_rows += output_rows as u64;
        self.total_bytes += output_bytes;
    }

    /// Mark the start of a call that produces at most one batch
    pub fn start_call(&mut self) {
        self.call_started = Some(Instant::now());
    }

    /// Whether the current call ran past the time limit
    pub fn time_budget_exceeded(&self) -> bool {
        match (self.time_limit, self.call_started) {
            (Some(limit), Some(started)) => started.elapsed() >= limit,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(100, 1000, 50, 10)]
    #[case(0, 1000, 50, 50)]
    #[case(1, 1000, 50, 50)]
    #[case(5000, 1000, 50, 1)]
    #[case(8, 1024, 10000, 128)]
    fn test_next_target_row_count(
        #[case] avg: u64,
        #[case] preferred: u64,
        #[case] max_rows: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(next_target_row_count(avg, preferred, max_rows), expected);
    }

    fn config() -> ScanConfig {
        ScanConfig::default()
            .with_preferred_batch_bytes(8000)
            .with_preferred_batch_rows(100)
            .with_max_batch_rows(1000)
    }

    #[test]
    fn test_running_average() {
        let mut sizer = BatchSizer::new(&config());
        assert_eq!(sizer.next_batch_rows(usize::MAX), 100);
        sizer.record_batch(100, 800);
        assert_eq!(sizer.average_row_bytes(), Some(8));
        assert_eq!(sizer.next_batch_rows(usize::MAX), 1000);
        sizer.record_batch(100, 3200);
        // (800 + 3200) / 200 rows
        assert_eq!(sizer.average_row_bytes(), Some(20));
        assert_eq!(sizer.next_batch_rows(usize::MAX), 400);
        assert_eq!(sizer.next_batch_rows(30), 30);
    }

    #[test]
    fn test_grows_after_empty_batch() {
        let mut sizer = BatchSizer::new(&config());
        sizer.hint_row_bytes(8);
        assert_eq!(sizer.next_batch_rows(1_000_000), 1000);

        let mut sizer = BatchSizer::new(&config().with_preferred_batch_bytes(80_000));
        assert_eq!(sizer.next_batch_rows(1_000_000), 100);
        sizer.record_batch(0, 0);
        assert_eq!(sizer.next_batch_rows(1_000_000), 100);
        sizer.record_batch(0, 0);
        sizer.hint_row_bytes(1);
        // Doubles from the last target rather than reading up to the budget at once
        assert_eq!(sizer.next_batch_rows(1_000_000), 200);
        sizer.record_batch(0, 0);
        assert_eq!(sizer.next_batch_rows(1_000_000), 400);
        sizer.record_batch(0, 0);
        assert_eq!(sizer.next_batch_rows(1_000_000), 800);
        sizer.record_batch(0, 0);
        assert_eq!(sizer.next_batch_rows(1_000_000), 1000);
    }

    #[test]
    fn test_time_budget() {
        let mut sizer = BatchSizer::new(&config());
        sizer.start_call();
        assert!(!sizer.time_budget_exceeded());

        let mut sizer = BatchSizer::new(&config().with_get_output_time_limit(Duration::ZERO));
        assert!(!sizer.time_budget_exceeded());
        sizer.start_call();
        assert!(sizer.time_budget_exceeded());
    }
}
