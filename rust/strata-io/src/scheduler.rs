// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use snafu::location;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use strata_core::cache::{Retention, ScanCache};
use strata_core::{Error, Result};

use crate::object_reader::Reader;
use crate::tracking::IoTracker;

/// A size-bounded executor for I/O bound work (opening files, reading ranges).
///
/// The executor never queues work it cannot start: [`IoExecutor::try_spawn`]
/// either starts the task immediately or hands it back to the caller. Callers
/// that can live without the work (e.g. speculative preloading) use it so that
/// a saturated executor degrades to "don't do it" instead of blocking.
#[derive(Debug)]
pub struct IoExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl IoExecutor {
    /// Create a new executor
    ///
    /// # Arguments
    ///
    /// * capacity - the maximum number of tasks that may run at the same time
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks that could be started right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn spawn_with_permit<F>(permit: OwnedSemaphorePermit, task: F) -> IoTaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = task.await;
            drop(permit);
            result
        });
        IoTaskHandle { handle }
    }

    /// Start `task` if there is a free slot. Never waits.
    ///
    /// Returns `Err(task)` if the executor is saturated (or closed).
    pub fn try_spawn<F>(&self, task: F) -> std::result::Result<IoTaskHandle<F::Output>, F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn_with_headroom(task, 0)
    }

    /// Start `task` only if `headroom` slots are still free once it runs. Never waits.
    ///
    /// The check and the reservation are one step on the semaphore, so concurrent
    /// callers cannot both take the last free slots.
    pub fn try_spawn_with_headroom<F>(
        &self,
        task: F,
        headroom: usize,
    ) -> std::result::Result<IoTaskHandle<F::Output>, F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let Some(wanted) = headroom.checked_add(1).and_then(|n| u32::try_from(n).ok()) else {
            return Err(task);
        };
        match self.permits.clone().try_acquire_many_owned(wanted) {
            Ok(mut permit) => {
                // Give the headroom back, the task keeps a single slot
                drop(permit.split(headroom));
                Ok(Self::spawn_with_permit(permit, task))
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => Err(task),
        }
    }

    /// Run `task` on the calling task once a slot is free
    pub async fn run<F: Future>(&self, task: F) -> Result<F::Output> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            Error::internal("I/O executor has been shut down", location!())
        })?;
        Ok(task.await)
    }
}

/// Handle to a task started on an [`IoExecutor`]
///
/// Dropping the handle aborts the task. Aborting never waits for the task
/// (or for a slot on the executor) so it is always safe on a driver thread.
#[derive(Debug)]
pub struct IoTaskHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> IoTaskHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the task to complete
    pub async fn join(mut self) -> Result<T> {
        let handle = &mut self.handle;
        Ok(handle.await?)
    }
}

impl<T> Drop for IoTaskHandle<T> {
    fn drop(&mut self) {
        // No-op when the task already completed
        self.handle.abort();
    }
}

/// A throttled, caching file reader that merges nearby ranges into one request.
///
/// Coalescing trades a bit of overread (the gap between two ranges) for fewer
/// requests. Overread is reported to the tracker so scans can expose it.
#[derive(Debug, Clone)]
pub struct CoalescingReader {
    reader: Arc<dyn Reader>,
    executor: Arc<IoExecutor>,
    cache: ScanCache,
    retention: Retention,
    max_gap: u64,
    tracker: Option<IoTracker>,
}

impl CoalescingReader {
    pub fn new(reader: Arc<dyn Reader>, executor: Arc<IoExecutor>, cache: ScanCache) -> Self {
        Self {
            reader,
            executor,
            cache,
            retention: Retention::Retain,
            max_gap: 0,
            tracker: None,
        }
    }

    /// Ranges separated by at most `max_gap` bytes are read with one request
    pub fn with_max_gap(mut self, max_gap: u64) -> Self {
        self.max_gap = max_gap;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_tracker(mut self, tracker: IoTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn reader(&self) -> &Arc<dyn Reader> {
        &self.reader
    }

    /// Load a batch of ranges
    ///
    /// The returned buffers are in the same order as `ranges`.
    pub async fn load(&self, ranges: Vec<Range<u64>>) -> Result<Vec<Bytes>> {
        let path = self.reader.path().clone();
        let mut results: Vec<Option<Bytes>> = ranges
            .iter()
            .map(|range| {
                if range.is_empty() {
                    Some(Bytes::new())
                } else {
                    self.cache.get(&path, range, self.retention)
                }
            })
            .collect();

        let mut misses: Vec<(usize, Range<u64>)> = ranges
            .iter()
            .enumerate()
            .filter(|(idx, _)| results[*idx].is_none())
            .map(|(idx, range)| (idx, range.clone()))
            .collect();
        if misses.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }
        misses.sort_by_key(|(_, range)| range.start);

        let (requests, overread) = coalesce(misses.iter().map(|(_, r)| r.clone()), self.max_gap);
        log::trace!(
            "Coalesced {} ranges of {} into {} requests ({} bytes overread)",
            misses.len(),
            path,
            requests.len(),
            overread
        );
        if overread > 0 {
            if let Some(tracker) = &self.tracker {
                tracker.record_overread(overread);
            }
        }

        let fetched = try_join_all(requests.iter().map(|request| {
            let reader = self.reader.clone();
            let request = request.clone();
            async move { self.executor.run(reader.get_range(request)).await? }
        }))
        .await?;

        for (idx, range) in misses {
            // Requests are sorted and disjoint so the owner is found by binary search
            let owner = requests.partition_point(|r| r.end <= range.start);
            let request = requests.get(owner).ok_or_else(|| {
                Error::internal(
                    format!("No coalesced request covers range {:?}", range),
                    location!(),
                )
            })?;
            let start = (range.start - request.start) as usize;
            let end = (range.end - request.start) as usize;
            let buffer = &fetched[owner];
            if end > buffer.len() {
                return Err(Error::io(
                    format!(
                        "Short read from {}: wanted {:?}, file ended at {}",
                        path,
                        range,
                        request.start + buffer.len() as u64
                    ),
                    location!(),
                ));
            }
            let data = buffer.slice(start..end);
            self.cache.insert(&path, &range, data.clone(), self.retention);
            results[idx] = Some(data);
        }
        Ok(results.into_iter().flatten().collect())
    }
}

/// Merge sorted ranges whose gap is at most `max_gap`. Returns the merged
/// requests and the number of gap bytes they read beyond what was asked.
fn coalesce(sorted: impl Iterator<Item = Range<u64>>, max_gap: u64) -> (Vec<Range<u64>>, u64) {
    let mut merged: Vec<Range<u64>> = Vec::new();
    let mut overread = 0;
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + max_gap => {
                overread += range.start.saturating_sub(last.end);
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    (merged, overread)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_store::{memory::InMemory, path::Path, ObjectStore};
    use rstest::rstest;

    use super::*;
    use crate::object_reader::CloudObjectReader;

    #[rstest]
    #[case::gap_within_limit(vec![0..10, 12..20, 100..110], 5, vec![0..20, 100..110], 2)]
    #[case::overlapping(vec![0..10, 5..8, 10..12], 0, vec![0..12], 0)]
    #[case::no_coalescing(vec![0..10, 11..20], 0, vec![0..10, 11..20], 0)]
    fn test_coalesce(
        #[case] ranges: Vec<Range<u64>>,
        #[case] max_gap: u64,
        #[case] expected: Vec<Range<u64>>,
        #[case] expected_overread: u64,
    ) {
        let (merged, overread) = coalesce(ranges.into_iter(), max_gap);
        assert_eq!(merged, expected);
        assert_eq!(overread, expected_overread);
    }

    #[tokio::test]
    async fn test_try_spawn_never_waits() {
        let executor = IoExecutor::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = executor
            .try_spawn(async move {
                let _ = rx.await;
                1
            })
            .ok()
            .unwrap();
        assert_eq!(executor.available(), 0);

        // Saturated: the task is handed back instead of queued
        let rejected = executor.try_spawn(async { 2 });
        assert!(rejected.is_err());

        tx.send(()).unwrap();
        assert_eq!(running.join().await.unwrap(), 1);
        assert_eq!(executor.available(), 1);
    }

    #[tokio::test]
    async fn test_spawn_with_headroom() {
        let executor = IoExecutor::new(3);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = executor
            .try_spawn_with_headroom(
                async move {
                    let _ = rx.await;
                },
                1,
            )
            .ok()
            .unwrap();
        // Only the task's own slot is taken
        assert_eq!(executor.available(), 2);

        let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();
        let second = executor
            .try_spawn_with_headroom(
                async move {
                    let _ = rx2.await;
                },
                1,
            )
            .ok()
            .unwrap();
        assert_eq!(executor.available(), 1);

        // One free slot is not enough once a slot of headroom is required
        assert!(executor.try_spawn_with_headroom(async {}, 1).is_err());
        assert_eq!(executor.available(), 1);
        assert!(executor.try_spawn_with_headroom(async {}, usize::MAX).is_err());

        tx.send(()).unwrap();
        tx2.send(()).unwrap();
        first.join().await.unwrap();
        second.join().await.unwrap();
        assert_eq!(executor.available(), 3);
    }

    #[tokio::test]
    async fn test_dropping_handle_aborts_and_releases_slot() {
        let executor = IoExecutor::new(1);
        let handle = executor
            .try_spawn(tokio::time::sleep(Duration::from_secs(3600)))
            .ok()
            .unwrap();
        drop(handle);
        // The permit is released once the aborted task is torn down
        for _ in 0..100 {
            if executor.available() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(executor.available(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_coalesced_load_with_cache() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let path = Path::from("data/f0");
        let data: Vec<u8> = (0..=255u8).collect();
        store
            .put(&path, Bytes::from(data.clone()).into())
            .await
            .unwrap();

        let tracker = IoTracker::default();
        let reader = tracker.wrap(Arc::new(CloudObjectReader::new(store, path)));
        let cache = ScanCache::with_capacity(1 << 20);
        let coalescing = CoalescingReader::new(reader, IoExecutor::new(4), cache.clone())
            .with_max_gap(8)
            .with_tracker(tracker.clone());

        let loaded = coalescing
            .load(vec![100..110, 0..4, 6..10, 200..201])
            .await
            .unwrap();
        assert_eq!(loaded[0].as_ref(), &data[100..110]);
        assert_eq!(loaded[1].as_ref(), &data[0..4]);
        assert_eq!(loaded[2].as_ref(), &data[6..10]);
        assert_eq!(loaded[3].as_ref(), &data[200..201]);

        let stats = tracker.incremental_stats();
        // 0..4 and 6..10 merge, the others stand alone
        assert_eq!(stats.read_iops, 3);
        assert_eq!(stats.overread_bytes, 2);

        // Second load is served from the cache
        coalescing.load(vec![0..4, 200..201]).await.unwrap();
        assert_eq!(tracker.incremental_stats().read_iops, 0);
        assert_eq!(cache.stats().hits, 2);
    }
}
