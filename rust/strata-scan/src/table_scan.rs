// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! The table scan operator
//!
//! A [`TableScan`] is driven by one driver at a time. Each call to
//! [`TableScan::next_output`] produces at most one batch: it takes splits from
//! the [`SplitScheduler`], opens a [`DataSource`] for each one and reads it
//! until it is exhausted. While a split is being read, the next few splits are
//! opened on the I/O executor so their footers are ready when needed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use arrow_schema::{Field, Schema, SchemaRef};
use futures::future::BoxFuture;
use futures::stream;
use snafu::location;
use strata_core::cache::ScanCache;
use strata_core::utils::tracing::StreamTracingExt;
use strata_core::{Error, Result, SYNTHESIZED_PREFIX};
use strata_io::scheduler::{IoExecutor, IoTaskHandle};
use strata_io::stream::{BatchStream, CountingBatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::batch_size::BatchSizer;
use crate::column::{ColumnKind, ColumnResolver, ScanProjection, SynthesizedColumn};
use crate::compiler::PredicateCompiler;
use crate::config::ScanConfig;
use crate::decoder::FileFormat;
use crate::expr::Expr;
use crate::filter::{merge_filter, FilterCondition, Subfield, SubfieldFilters};
use crate::lazy::ScanBatch;
use crate::metrics::ScanMetrics;
use crate::scheduler::{ScheduledSplit, SplitPoll, SplitScheduler};
use crate::source::{DataSource, ResidualFilter, ScanContext, SourceOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    WaitingForSplit,
    OpeningSource,
    ReadingUnit,
    YieldedMidUnit,
    SplitExhausted,
    Finished,
    Failed,
}

/// Result of one [`TableScan::next_output`] call
pub enum ScanOutput {
    Batch(ScanBatch),
    /// The time budget ran out before a batch was complete or between splits
    Yield,
    /// No split is available yet. The future resolves when that may have changed.
    Blocked(BoxFuture<'static, ()>),
    Finished,
}

impl std::fmt::Debug for ScanOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch(batch) => f
                .debug_struct("Batch")
                .field("num_rows", &batch.num_rows())
                .finish(),
            Self::Yield => f.write_str("Yield"),
            Self::Blocked(_) => f.write_str("Blocked"),
            Self::Finished => f.write_str("Finished"),
        }
    }
}

/// Configures a [`TableScan`]
#[derive(Debug)]
pub struct TableScanBuilder {
    scheduler: Arc<SplitScheduler>,
    node_id: String,
    format: Arc<dyn FileFormat>,
    output_schema: SchemaRef,
    data_schema: Option<SchemaRef>,
    resolver: ColumnResolver,
    filter: Option<Expr>,
    subfield_filters: Vec<(Subfield, FilterCondition)>,
    merge_duplicate_subfields: bool,
    config: ScanConfig,
    cache: ScanCache,
    executor: Option<Arc<IoExecutor>>,
    cancel: CancellationToken,
    metrics: Arc<ScanMetrics>,
}

impl TableScanBuilder {
    pub fn new(
        scheduler: Arc<SplitScheduler>,
        node_id: impl Into<String>,
        format: Arc<dyn FileFormat>,
        output_schema: SchemaRef,
    ) -> Self {
        Self {
            scheduler,
            node_id: node_id.into(),
            format,
            output_schema,
            data_schema: None,
            resolver: ColumnResolver::default(),
            filter: None,
            subfield_filters: Vec::new(),
            merge_duplicate_subfields: false,
            config: ScanConfig::default(),
            cache: ScanCache::no_cache(),
            executor: None,
            cancel: CancellationToken::new(),
            metrics: Arc::new(ScanMetrics::default()),
        }
    }

    /// Schema of the table, used to type columns that only filters reference
    pub fn with_data_schema(mut self, schema: SchemaRef) -> Self {
        self.data_schema = Some(schema);
        self
    }

    pub fn with_resolver(mut self, resolver: ColumnResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_subfield_filter(
        mut self,
        subfield: impl Into<Subfield>,
        condition: FilterCondition,
    ) -> Self {
        self.subfield_filters.push((subfield.into(), condition));
        self
    }

    pub fn with_merge_duplicate_subfields(mut self, merge: bool) -> Self {
        self.merge_duplicate_subfields = merge;
        self
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: ScanCache) -> Self {
        self.cache = cache;
        self
    }

    /// Share an executor between scans. By default each scan gets its own,
    /// sized by [`ScanConfig::io_parallelism`].
    pub fn with_executor(mut self, executor: Arc<IoExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Columns the filters need that the output does not have
    fn hidden_columns(&self, output: &ScanProjection) -> Result<Schema> {
        let mut names = self
            .filter
            .as_ref()
            .map(|f| f.column_refs())
            .unwrap_or_default();
        names.extend(
            self.subfield_filters
                .iter()
                .map(|(subfield, _)| subfield.root.clone()),
        );

        let mut fields = Vec::new();
        for name in names {
            if output.lookup(&name).is_some() {
                continue;
            }
            let data_field = self
                .data_schema
                .as_ref()
                .and_then(|schema| schema.field_with_name(&name).ok());
            let field = match (data_field, SynthesizedColumn::from_name(&name)) {
                (Some(field), _) => field.clone(),
                (None, Some(column)) => Field::new(column.name(), column.data_type(), true),
                (None, None) if name.starts_with(SYNTHESIZED_PREFIX) => {
                    return Err(Error::invalid_input(
                        format!("Unknown synthesized column {}", name),
                        location!(),
                    ))
                }
                (None, None) => {
                    return Err(Error::invalid_input(
                        format!("Filter references unknown column {}", name),
                        location!(),
                    ))
                }
            };
            fields.push(field);
        }
        Ok(Schema::new(fields))
    }

    pub fn build(self) -> Result<TableScan> {
        self.config.validate()?;
        let output = self.resolver.resolve(&self.output_schema)?;
        let hidden = self.hidden_columns(&output)?;
        let projection = self
            .resolver
            .resolve_with_hidden(&self.output_schema, &hidden)?;
        let compiled = PredicateCompiler::new(&projection)
            .with_merge_duplicate_subfields(self.merge_duplicate_subfields)
            .compile(self.filter, self.subfield_filters)?;
        log::debug!(
            "Scan node {}: {} pushed down filters, residual {}",
            self.node_id,
            compiled.filters.len(),
            compiled
                .residual
                .as_ref()
                .map_or_else(|| "none".to_string(), |r| r.to_string())
        );

        let executor = self
            .executor
            .unwrap_or_else(|| IoExecutor::new(self.config.io_parallelism));
        let sizer = BatchSizer::new(&self.config);
        let context = ScanContext::try_new(
            self.format,
            Arc::new(projection),
            compiled.residual,
            self.config,
            executor,
            self.cache,
        )?
        .with_metrics(self.metrics);

        Ok(TableScan {
            node_id: self.node_id,
            scheduler: self.scheduler,
            context: Arc::new(context),
            filters: Arc::new(compiled.filters),
            sizer,
            cancel: self.cancel,
            state: ScanState::Idle,
            current: None,
            preloads: VecDeque::new(),
        })
    }
}

#[derive(Debug)]
struct CurrentSplit {
    scheduled: ScheduledSplit,
    source: DataSource,
}

/// Executor slots a preload leaves free. A preload holds its slot while the
/// reads it issues wait for another one.
const PRELOAD_HEADROOM: usize = 1;

/// A split taken from the scheduler ahead of time
#[derive(Debug)]
struct Preload {
    scheduled: ScheduledSplit,
    /// `None` once reclaimed (or if the executor was saturated), the split is
    /// then opened when its turn comes
    task: Option<IoTaskHandle<Result<DataSource>>>,
}

enum NextSource {
    Ready(CurrentSplit),
    Blocked(BoxFuture<'static, ()>),
    Finished,
}

/// Pulls splits of one scan node and turns them into batches
#[derive(Debug)]
pub struct TableScan {
    node_id: String,
    scheduler: Arc<SplitScheduler>,
    context: Arc<ScanContext>,
    /// Pushed down filters by physical subfield, dynamic filters included
    filters: Arc<SubfieldFilters>,
    sizer: BatchSizer,
    cancel: CancellationToken,
    state: ScanState,
    current: Option<CurrentSplit>,
    /// In scheduler order
    preloads: VecDeque<Preload>,
}

impl TableScan {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn schema(&self) -> &SchemaRef {
        self.context.projection.schema()
    }

    pub fn projection(&self) -> &Arc<ScanProjection> {
        &self.context.projection
    }

    pub fn pushed_filters(&self) -> &SubfieldFilters {
        &self.filters
    }

    pub fn residual(&self) -> &ResidualFilter {
        &self.context.residual
    }

    pub fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.context.metrics
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Splits taken from the scheduler and waiting to be read
    pub fn num_preloads(&self) -> usize {
        self.preloads.len()
    }

    fn transition(&mut self, state: ScanState) {
        if self.state != state {
            log::trace!("Scan node {}: {:?} -> {:?}", self.node_id, self.state, state);
            self.state = state;
        }
    }

    /// AND a runtime filter on `column` into the pushed down filters
    ///
    /// Only splits opened after this call see the filter.
    pub fn add_dynamic_filter(&mut self, column: &str, condition: FilterCondition) -> Result<()> {
        let (_, handle) = self.context.projection.lookup(column).ok_or_else(|| {
            Error::invalid_input(
                format!("Dynamic filter on unknown column {}", column),
                location!(),
            )
        })?;
        if !matches!(handle.kind, ColumnKind::Regular | ColumnKind::PartitionKey) {
            return Err(Error::invalid_input(
                format!("Dynamic filter on {} cannot be pushed down", column),
                location!(),
            ));
        }
        let condition = condition.cast_to(&handle.data_type)?;
        log::debug!(
            "Scan node {}: dynamic filter {:?} on {}",
            self.node_id,
            condition,
            handle.physical_name
        );
        let mut filters = (*self.filters).clone();
        merge_filter(
            &mut filters,
            Subfield::new(handle.physical_name.clone()),
            condition,
        )?;
        self.filters = Arc::new(filters);
        Ok(())
    }

    /// Produce the next output of the scan
    ///
    /// Once this returns an error the scan is failed and the owning task with it.
    #[instrument(level = "debug", skip_all, fields(node = %self.node_id))]
    pub async fn next_output(&mut self) -> Result<ScanOutput> {
        let started = Instant::now();
        let result = self.drive().await;
        let metrics = &self.context.metrics;
        ScanMetrics::add_duration(&metrics.total_scan_time_nanos, started.elapsed());
        metrics.record_io(&self.context.tracker.incremental_stats());

        match result {
            Ok(output) => Ok(output),
            Err(e) => {
                let e = if self.cancel.is_cancelled() && !e.is_cancelled() {
                    log::debug!("Reporting cancellation instead of {}", e);
                    Error::cancelled(location!())
                } else {
                    e
                };
                if self.state != ScanState::Failed {
                    self.transition(ScanState::Failed);
                    self.abandon_splits();
                    self.scheduler.fail(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<ScanOutput> {
        match self.state {
            ScanState::Finished => return Ok(ScanOutput::Finished),
            ScanState::Failed => {
                return Err(Error::Execution {
                    message: format!("Scan node {} has failed", self.node_id),
                    location: location!(),
                })
            }
            _ => {}
        }
        self.sizer.start_call();
        let mut finished_splits = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::cancelled(location!()));
            }
            if self.current.is_none() {
                match self.next_source().await? {
                    NextSource::Ready(current) => self.current = Some(current),
                    NextSource::Blocked(ready) => return Ok(ScanOutput::Blocked(ready)),
                    NextSource::Finished => return Ok(ScanOutput::Finished),
                }
                // Empty and skipped splits produce no batch, the budget is checked between them
                if finished_splits > 0 && self.sizer.time_budget_exceeded() {
                    ScanMetrics::add(&self.context.metrics.yield_count, 1);
                    self.transition(ScanState::SplitExhausted);
                    return Ok(ScanOutput::Yield);
                }
            }
            self.start_preloads();

            self.transition(ScanState::ReadingUnit);
            let Some(current) = self.current.as_mut() else {
                continue;
            };
            match current.source.next_batch(&mut self.sizer, &self.cancel).await? {
                SourceOutput::Batch(batch) => return Ok(ScanOutput::Batch(batch)),
                SourceOutput::Yield => {
                    ScanMetrics::add(&self.context.metrics.yield_count, 1);
                    self.transition(ScanState::YieldedMidUnit);
                    return Ok(ScanOutput::Yield);
                }
                SourceOutput::Exhausted => {
                    self.transition(ScanState::SplitExhausted);
                    self.finish_split();
                    finished_splits += 1;
                }
            }
        }
    }

    async fn next_source(&mut self) -> Result<NextSource> {
        let (scheduled, task) = match self.preloads.pop_front() {
            Some(preload) => (preload.scheduled, preload.task),
            None => match self.scheduler.poll_split(&self.node_id) {
                SplitPoll::Split(scheduled) => (scheduled, None),
                SplitPoll::Blocked(ready) => {
                    self.transition(ScanState::WaitingForSplit);
                    return Ok(NextSource::Blocked(ready));
                }
                SplitPoll::NoMoreSplits => {
                    log::debug!("Scan node {} finished", self.node_id);
                    self.transition(ScanState::Finished);
                    return Ok(NextSource::Finished);
                }
                SplitPoll::Failed(message) => {
                    return Err(Error::Execution {
                        message: format!("Task {} failed: {}", self.scheduler.task_id(), message),
                        location: location!(),
                    })
                }
            },
        };

        self.transition(ScanState::OpeningSource);
        let source = match task {
            Some(task) => {
                let opened = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Error::cancelled(location!())),
                    opened = task.join() => opened,
                };
                opened??
            }
            None => {
                DataSource::open(
                    scheduled.split.clone(),
                    self.context.clone(),
                    self.filters.clone(),
                )
                .await?
            }
        };
        Ok(NextSource::Ready(CurrentSplit { scheduled, source }))
    }

    /// Open upcoming splits on the executor, up to the preload limit
    fn start_preloads(&mut self) {
        let max_preloads = self.context.config.max_split_preloads;
        while self.preloads.len() < max_preloads {
            // Avoids taking a split from the scheduler when no preload could start
            if self.context.executor.available() <= PRELOAD_HEADROOM {
                log::trace!("Scan node {}: executor saturated, not preloading", self.node_id);
                return;
            }
            let SplitPoll::Split(scheduled) = self.scheduler.poll_split(&self.node_id) else {
                return;
            };
            let open = DataSource::open(
                scheduled.split.clone(),
                self.context.clone(),
                self.filters.clone(),
            )
            .in_current_span();
            match self
                .context
                .executor
                .try_spawn_with_headroom(open, PRELOAD_HEADROOM)
            {
                Ok(task) => {
                    log::debug!("Scan node {}: preloading {}", self.node_id, scheduled.split);
                    ScanMetrics::add(&self.context.metrics.preloaded_splits, 1);
                    self.preloads.push_back(Preload {
                        scheduled,
                        task: Some(task),
                    });
                }
                Err(_) => {
                    log::debug!(
                        "Scan node {}: executor saturated, {} will be opened when reached",
                        self.node_id,
                        scheduled.split
                    );
                    self.preloads.push_back(Preload {
                        scheduled,
                        task: None,
                    });
                    return;
                }
            }
        }
    }

    fn finish_split(&mut self) {
        if let Some(current) = self.current.take() {
            log::debug!(
                "Scan node {}: finished split {}",
                self.node_id,
                current.scheduled.split
            );
            self.scheduler
                .split_finished(&self.node_id, &current.scheduled);
            ScanMetrics::add(&self.context.metrics.processed_splits, 1);
        }
    }

    /// Release memory held by preloaded splits
    ///
    /// Outstanding preloads are aborted. Their splits stay queued in this scan and
    /// are opened when reached. Returns the number of preloads released.
    pub fn reclaim(&mut self) -> usize {
        let mut released = 0;
        for preload in &mut self.preloads {
            if let Some(task) = preload.task.take() {
                task.abort();
                released += 1;
            }
        }
        if released > 0 {
            log::debug!(
                "Scan node {}: released {} preloaded splits",
                self.node_id,
                released
            );
        }
        released
    }

    /// Hand back every split this scan took from the scheduler without finishing it
    fn abandon_splits(&mut self) {
        let mut abandoned = Vec::with_capacity(self.preloads.len() + 1);
        abandoned.extend(self.current.take().map(|current| current.scheduled));
        for preload in self.preloads.drain(..) {
            if let Some(task) = preload.task {
                task.abort();
            }
            abandoned.push(preload.scheduled);
        }
        for scheduled in abandoned {
            log::debug!(
                "Scan node {}: abandoned split {}",
                self.node_id,
                scheduled.split
            );
            self.scheduler.split_abandoned(&self.node_id, &scheduled);
        }
    }

    /// Stop the scan. Outstanding preloads are aborted without waiting for them.
    pub fn close(&mut self) {
        self.abandon_splits();
        if self.state != ScanState::Failed {
            self.transition(ScanState::Finished);
        }
    }

    /// A stream of materialized batches
    pub fn into_stream(self) -> impl BatchStream {
        let schema = self.schema().clone();
        let batches = stream::try_unfold(self, |mut scan| async move {
            loop {
                match scan.next_output().await? {
                    ScanOutput::Batch(batch) => {
                        return Ok(Some((batch.into_record_batch()?, scan)));
                    }
                    ScanOutput::Yield => tokio::task::yield_now().await,
                    ScanOutput::Blocked(ready) => {
                        let cancel = scan.cancel.clone();
                        tokio::select! {
                            _ = ready => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    ScanOutput::Finished => return Ok::<_, Error>(None),
                }
            }
        });
        CountingBatchStream::new(schema, batches.stream_in_current_span())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arrow_array::{ArrayRef, Int64Array, RecordBatch};
    use arrow_schema::DataType;
    use strata_core::ErrorKind;

    use super::*;
    use crate::split::Split;
    use crate::testing::{MemoryFormat, WriteOptions};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]))
    }

    async fn write(format: &MemoryFormat, path: &str, values: Vec<i64>) {
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        format
            .write_file(path, &[batch], WriteOptions::default())
            .await
            .unwrap();
    }

    fn expect_batch(output: ScanOutput) -> ScanBatch {
        match output {
            ScanOutput::Batch(batch) => batch,
            other => panic!("Expected a batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_until_split_arrives() {
        let format = Arc::new(MemoryFormat::new());
        write(&format, "t/f0", vec![1, 2, 3]).await;
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .build()
            .unwrap();

        let ScanOutput::Blocked(ready) = scan.next_output().await.unwrap() else {
            panic!("Expected the scan to block");
        };
        assert_eq!(scan.state(), ScanState::WaitingForSplit);
        scheduler.add_split("scan", Split::new("t/f0"));
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .unwrap();

        let batch = expect_batch(scan.next_output().await.unwrap());
        assert_eq!(batch.num_rows(), 3);
        scheduler.no_more_splits("scan");
        assert!(matches!(
            scan.next_output().await.unwrap(),
            ScanOutput::Finished
        ));
        assert_eq!(scan.state(), ScanState::Finished);
        assert_eq!(ScanMetrics::get(&scan.metrics().processed_splits), 1);
        assert_eq!(scheduler.stats("scan").completed_count, 1);
    }

    #[tokio::test]
    async fn test_preload_and_reclaim() {
        let format = Arc::new(MemoryFormat::new());
        for i in 0..4 {
            write(&format, &format!("t/f{}", i), vec![i; 10]).await;
        }
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        for i in 0..4 {
            scheduler.add_split("scan", Split::new(format!("t/f{}", i)));
        }
        scheduler.no_more_splits("scan");
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .with_config(ScanConfig::default().with_max_split_preloads(2))
            .build()
            .unwrap();

        let batch = expect_batch(scan.next_output().await.unwrap());
        assert_eq!(batch.num_rows(), 10);
        assert_eq!(scan.num_preloads(), 2);
        assert_eq!(ScanMetrics::get(&scan.metrics().preloaded_splits), 2);

        assert_eq!(scan.reclaim(), 2);
        assert_eq!(scan.reclaim(), 0);

        // Reclaimed splits are still read, in order
        let mut firsts = vec![];
        loop {
            match scan.next_output().await.unwrap() {
                ScanOutput::Batch(batch) => {
                    let batch = batch.into_record_batch().unwrap();
                    let values = batch
                        .column(0)
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .unwrap();
                    firsts.push(values.value(0));
                }
                ScanOutput::Finished => break,
                other => panic!("Unexpected {:?}", other),
            }
        }
        assert_eq!(firsts, vec![1, 2, 3]);
        assert_eq!(ScanMetrics::get(&scan.metrics().processed_splits), 4);
    }

    #[tokio::test]
    async fn test_close_releases_preloads() {
        let format = Arc::new(MemoryFormat::new());
        format.slow_reads(Duration::from_millis(50));
        for i in 0..3 {
            write(&format, &format!("t/f{}", i), vec![i]).await;
        }
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        for i in 0..3 {
            scheduler.add_split("scan", Split::new(format!("t/f{}", i)));
        }
        let executor = IoExecutor::new(4);
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .with_executor(executor.clone())
            .with_config(ScanConfig::default().with_max_split_preloads(2))
            .build()
            .unwrap();
        expect_batch(scan.next_output().await.unwrap());
        assert_eq!(scan.num_preloads(), 2);

        scan.close();
        assert_eq!(scan.num_preloads(), 0);
        // The split being read and both preloads go back unfinished
        let stats = scheduler.stats("scan");
        assert_eq!(stats.running_count, 0);
        assert_eq!(stats.completed_count, 0);
        assert!(matches!(
            scan.next_output().await.unwrap(),
            ScanOutput::Finished
        ));
        // Aborted preloads give their executor slots back
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.available() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_task() {
        let format = Arc::new(MemoryFormat::new());
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        scheduler.add_split("scan", Split::new("t/none"));
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .build()
            .unwrap();
        let err = scan.next_output().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingResource);
        assert_eq!(err.split_path(), Some("t/none"));
        assert_eq!(scan.state(), ScanState::Failed);
        assert!(scheduler.is_failed());
        assert_eq!(scheduler.stats("scan").running_count, 0);
        assert!(scan.next_output().await.is_err());
    }

    #[tokio::test]
    async fn test_failure_releases_current_and_preloaded_splits() {
        let format = Arc::new(MemoryFormat::new());
        for i in 0..3 {
            write(&format, &format!("t/f{}", i), vec![i; 4]).await;
        }
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        for i in 0..3 {
            scheduler.add_split("scan", Split::new(format!("t/f{}", i)));
        }
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .with_config(ScanConfig::default().with_max_split_preloads(1))
            .build()
            .unwrap();
        expect_batch(scan.next_output().await.unwrap());
        assert_eq!(scheduler.stats("scan").running_count, 2);

        scan.cancellation_token().cancel();
        let err = scan.next_output().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(scan.state(), ScanState::Failed);
        let stats = scheduler.stats("scan");
        assert_eq!(stats.running_count, 0);
        assert_eq!(stats.running_weight, 0);
        assert_eq!(stats.queued_count, 1);
    }

    #[tokio::test]
    async fn test_yields_between_skipped_splits() {
        let format = Arc::new(MemoryFormat::new());
        for i in 0..4 {
            write(&format, &format!("t/f{}", i), vec![i; 5]).await;
        }
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        for i in 0..4 {
            scheduler.add_split("scan", Split::new(format!("t/f{}", i)));
        }
        scheduler.no_more_splits("scan");
        let config = ScanConfig::default().with_get_output_time_limit(Duration::ZERO);
        let mut scan = TableScanBuilder::new(scheduler.clone(), "scan", format, schema())
            .with_config(config)
            .with_filter(crate::expr::col("a").gt_eq(crate::expr::lit(3i64)))
            .build()
            .unwrap();

        let mut outputs = vec![];
        loop {
            match scan.next_output().await.unwrap() {
                ScanOutput::Yield => outputs.push("yield"),
                ScanOutput::Batch(batch) => {
                    assert_eq!(batch.num_rows(), 5);
                    outputs.push("batch");
                }
                ScanOutput::Finished => break,
                other => panic!("Unexpected {:?}", other),
            }
        }
        // One split change per call while the first three splits are skipped
        assert_eq!(outputs, vec!["yield", "yield", "yield", "batch"]);
        assert_eq!(ScanMetrics::get(&scan.metrics().yield_count), 3);
        assert_eq!(ScanMetrics::get(&scan.metrics().processed_splits), 4);
        assert_eq!(scheduler.stats("scan").completed_count, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scans_sharing_a_small_executor_finish() {
        let format = Arc::new(MemoryFormat::new());
        format.slow_reads(Duration::from_millis(2));
        for i in 0..6 {
            write(&format, &format!("t/f{}", i), vec![i; 3]).await;
        }
        let executor = IoExecutor::new(2);
        let scans = (0..2)
            .map(|n| {
                let scheduler = Arc::new(SplitScheduler::new(format!("t{}", n)));
                for i in 0..3 {
                    scheduler.add_split("scan", Split::new(format!("t/f{}", n * 3 + i)));
                }
                scheduler.no_more_splits("scan");
                TableScanBuilder::new(scheduler, "scan", format.clone(), schema())
                    .with_executor(executor.clone())
                    .with_config(ScanConfig::default().with_max_split_preloads(2))
                    .build()
                    .unwrap()
            })
            .collect::<Vec<_>>();

        let runs = scans.into_iter().map(|mut scan| {
            tokio::spawn(async move {
                let mut rows = 0;
                loop {
                    match scan.next_output().await.unwrap() {
                        ScanOutput::Batch(batch) => rows += batch.num_rows(),
                        ScanOutput::Yield => {}
                        ScanOutput::Finished => return rows,
                        other => panic!("Unexpected {:?}", other),
                    }
                }
            })
        });
        let rows = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(runs))
            .await
            .unwrap();
        for rows in rows {
            assert_eq!(rows.unwrap(), 9);
        }
        assert_eq!(executor.available(), 2);
    }

    #[tokio::test]
    async fn test_unknown_filter_column() {
        let scheduler = Arc::new(SplitScheduler::new("t0"));
        let err = TableScanBuilder::new(
            scheduler,
            "scan",
            Arc::new(MemoryFormat::new()),
            schema(),
        )
        .with_filter(crate::expr::col("b").is_null())
        .build()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
    }
}
