// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Reading a single split
//!
//! A [`DataSource`] is created per split. Opening it decides whether the split
//! has to be read at all (partition values, missing columns, file and row group
//! statistics). Reading then walks the surviving row groups in steps sized by the
//! [`BatchSizer`], applies the residual filter, and hands out lazy batches.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use arrow_array::{new_null_array, Array, ArrayRef, Int32Array, Int64Array, StringArray, StructArray};
use arrow_schema::{DataType, FieldRef};
use snafu::location;
use strata_arrow::{Indentation, SchemaExt};
use strata_core::cache::{Retention, ScanCache};
use strata_core::{Error, ErrorKind, Result, ROW_ID_FIELDS, ROW_ID_TYPE, ROW_INDEX_TYPE};
use strata_io::object_reader::FileInfo;
use strata_io::scheduler::IoExecutor;
use strata_io::tracking::IoTracker;
use strata_io::RowSelection;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::batch_size::BatchSizer;
use crate::column::{
    check_compatible, parse_partition_value, ColumnKind, ScanProjection, SynthesizedColumn,
};
use crate::compiler::subfield_type;
use crate::config::ScanConfig;
use crate::decoder::{FileFormat, OpenOptions, RowGroupInfo, SplitReader, UnitRead};
use crate::expr::Expr;
use crate::filter::SubfieldFilters;
use crate::lazy::{ColumnLoader, ColumnVector, LazyColumn, ReaderVersion, ScanBatch};
use crate::metrics::ScanMetrics;
use crate::split::{RowIdProperties, Split};
use crate::stats::StatsSkipper;

/// The part of a filter that is evaluated on loaded values
///
/// Conjuncts are applied one after the other, each one only on the rows that
/// passed the ones before. Columns of a conjunct with a disjunction are loaded
/// for the whole batch up front, every other column only for the rows still
/// alive when its conjunct runs.
#[derive(Debug, Clone, Default)]
pub struct ResidualFilter {
    conjuncts: Vec<Expr>,
    eager_columns: Vec<usize>,
}

impl ResidualFilter {
    pub fn try_new(residual: Option<Expr>, projection: &ScanProjection) -> Result<Self> {
        let conjuncts = residual.map(Expr::into_conjuncts).unwrap_or_default();
        let mut eager = BTreeSet::new();
        for conjunct in &conjuncts {
            for name in conjunct.column_refs() {
                let (index, _) = projection.lookup(&name).ok_or_else(|| {
                    Error::invalid_input(
                        format!("Filter references unknown column {}", name),
                        location!(),
                    )
                })?;
                if conjunct.has_disjunction() {
                    eager.insert(index);
                }
            }
        }
        Ok(Self {
            conjuncts,
            eager_columns: eager.into_iter().collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conjuncts.is_empty()
    }

    pub fn conjuncts(&self) -> &[Expr] {
        &self.conjuncts
    }

    /// Columns loaded for every row of a batch before any conjunct runs
    pub fn eager_columns(&self) -> &[usize] {
        &self.eager_columns
    }

    /// Narrow `batch` to the rows passing every conjunct
    pub fn apply(&self, batch: &mut ScanBatch) -> Result<()> {
        if self.conjuncts.is_empty() || batch.num_rows() == 0 {
            return Ok(());
        }
        for &index in &self.eager_columns {
            batch.load(index)?;
        }
        for conjunct in &self.conjuncts {
            let mask = conjunct.evaluate_mask(batch)?;
            if mask.null_count() == 0 && mask.true_count() == mask.len() {
                continue;
            }
            let selection = match batch.selection() {
                Some(selection) => selection.filter(&mask),
                None => RowSelection::all(batch.num_rows()).filter(&mask),
            };
            batch.select(selection);
            if batch.num_rows() == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// What the data sources of one scan share
#[derive(Debug)]
pub struct ScanContext {
    pub format: Arc<dyn FileFormat>,
    pub projection: Arc<ScanProjection>,
    pub residual: ResidualFilter,
    pub config: ScanConfig,
    pub executor: Arc<IoExecutor>,
    pub cache: ScanCache,
    pub metrics: Arc<ScanMetrics>,
    pub tracker: IoTracker,
}

impl ScanContext {
    pub fn try_new(
        format: Arc<dyn FileFormat>,
        projection: Arc<ScanProjection>,
        residual: Option<Expr>,
        config: ScanConfig,
        executor: Arc<IoExecutor>,
        cache: ScanCache,
    ) -> Result<Self> {
        let residual = ResidualFilter::try_new(residual, &projection)?;
        Ok(Self {
            format,
            projection,
            residual,
            config,
            executor,
            cache,
            metrics: Arc::new(ScanMetrics::default()),
            tracker: IoTracker::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn open_options(&self, split: &Split) -> OpenOptions {
        OpenOptions {
            executor: self.executor.clone(),
            cache: self.cache.clone(),
            retention: if split.cacheable {
                Retention::Retain
            } else {
                Retention::DoNotRetain
            },
            tracker: self.tracker.clone(),
            coalesce_bytes: self.config.io_coalesce_bytes,
        }
    }
}

/// Result of one [`DataSource::next_batch`] call
#[derive(Debug)]
pub enum SourceOutput {
    Batch(ScanBatch),
    /// The time budget of the call ran out, call again to continue
    Yield,
    Exhausted,
}

#[derive(Debug)]
enum ColumnOrigin {
    /// Position among the columns requested from the reader
    File(usize),
    /// The same value on every row of the split
    Constant(ArrayRef),
    RowIndex,
    RowId(RowIdProperties),
}

#[derive(Debug)]
struct OpenSplit {
    reader: Box<dyn SplitReader>,
    origins: Vec<ColumnOrigin>,
    read_columns: Vec<String>,
    /// Pushed down filters keyed by file column names
    filters: SubfieldFilters,
    /// Positions in the reader's row groups that survived pruning
    row_groups: Vec<usize>,
    /// Cursor: position in `row_groups` and the next row within that row group
    position: usize,
    row: usize,
}

impl OpenSplit {
    fn build_batch(
        &self,
        projection: &Arc<ScanProjection>,
        version: &ReaderVersion,
        info: &RowGroupInfo,
        rows: &Range<usize>,
        read: UnitRead,
    ) -> Result<ScanBatch> {
        version.advance();
        let stamp = version.stamp();
        let first_row = info.first_row + rows.start as u64;
        let columns = projection
            .columns()
            .iter()
            .zip(&self.origins)
            .map(|(handle, origin)| {
                let loader: Arc<dyn ColumnLoader> = match origin {
                    ColumnOrigin::File(position) => {
                        read.columns.get(*position).cloned().ok_or_else(|| {
                            Error::internal(
                                format!("Reader returned no loader for column {}", handle.name),
                                location!(),
                            )
                        })?
                    }
                    ColumnOrigin::Constant(value) => Arc::new(ConstantLoader(value.clone())),
                    ColumnOrigin::RowIndex => Arc::new(RowIndexLoader { first_row }),
                    ColumnOrigin::RowId(properties) => Arc::new(RowIdLoader {
                        first_row,
                        properties: properties.clone(),
                    }),
                };
                Ok(LazyColumn::new(
                    loader,
                    handle.data_type.clone(),
                    read.passing.clone(),
                    stamp.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ScanBatch::new(
            projection.clone(),
            columns,
            read.passing.len(),
        ))
    }
}

/// Reads the rows of one split that pass the scan's filters
#[derive(Debug)]
pub struct DataSource {
    split: Split,
    context: Arc<ScanContext>,
    /// `None` when there is nothing to read
    open: Option<OpenSplit>,
    version: ReaderVersion,
    steps: usize,
}

impl DataSource {
    /// Open `split` and decide which of its row groups need reading
    ///
    /// `filters` are keyed by physical subfield. Errors carry the split's path.
    #[instrument(name = "open_split", level = "debug", skip_all, fields(path = %split.path))]
    pub async fn open(
        split: Split,
        context: Arc<ScanContext>,
        filters: Arc<SubfieldFilters>,
    ) -> Result<Self> {
        let open = Self::open_split(&split, &context, &filters)
            .await
            .map_err(|e| e.in_split(split.path.to_string()))?;
        Ok(Self {
            split,
            context,
            open,
            version: ReaderVersion::default(),
            steps: 0,
        })
    }

    pub fn split(&self) -> &Split {
        &self.split
    }

    /// Whether opening found nothing to read
    pub fn is_empty(&self) -> bool {
        self.open.is_none()
    }

    /// The file's row groups left to read after pruning
    pub fn num_row_groups(&self) -> usize {
        self.open.as_ref().map_or(0, |open| open.row_groups.len())
    }

    async fn open_split(
        split: &Split,
        context: &ScanContext,
        filters: &SubfieldFilters,
    ) -> Result<Option<OpenSplit>> {
        let projection = &context.projection;
        let config = &context.config;
        let metrics = &context.metrics;

        // Partition values first, they can rule out the split without any I/O
        let mut partition_values = HashMap::new();
        for (index, handle) in projection.columns().iter().enumerate() {
            match handle.kind {
                ColumnKind::PartitionKey => {
                    let value = split
                        .partition_keys
                        .get(&handle.physical_name)
                        .and_then(|v| v.as_deref());
                    let scalar = parse_partition_value(value, &handle.data_type, config)?;
                    for (subfield, condition) in filters {
                        if subfield.root == handle.physical_name
                            && subfield.is_root()
                            && !condition.test_scalar(&scalar)?
                        {
                            log::debug!(
                                "Skipping split {}: partition value {:?} of {} fails {:?}",
                                split,
                                value,
                                handle.physical_name,
                                condition
                            );
                            ScanMetrics::add(&metrics.skipped_splits, 1);
                            return Ok(None);
                        }
                    }
                    partition_values.insert(index, scalar.to_array()?);
                }
                ColumnKind::RowId if split.row_id.is_none() => {
                    return Err(Error::invalid_input(
                        format!(
                            "Column {} needs row id properties which split {} does not have",
                            handle.name, split
                        ),
                        location!(),
                    ));
                }
                _ => {}
            }
        }

        let reader = match context
            .format
            .open_split(split, context.open_options(split))
            .await
        {
            Ok(reader) => reader,
            Err(e) if config.ignore_missing_files && e.kind() == ErrorKind::MissingResource => {
                log::warn!("Skipping missing file {}: {}", split.path, e);
                ScanMetrics::add(&metrics.missing_files, 1);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let file_schema = reader.file_schema();
        let file_info = reader.file_info();
        log::trace!(
            "Opened {} ({} bytes) with schema {}",
            split.path,
            file_info.size,
            file_schema.to_compact_string(Indentation::OneLine)
        );
        let mut file_fields: HashMap<&str, FieldRef> = HashMap::new();
        let mut read_columns = Vec::new();
        let mut origins = Vec::with_capacity(projection.columns().len());
        for (index, handle) in projection.columns().iter().enumerate() {
            let origin = match handle.kind {
                ColumnKind::Regular => match file_schema
                    .field_by_name(&handle.physical_name, config.case_insensitive_column_names)
                {
                    Some((_, field)) => {
                        check_compatible(&handle.name, field.data_type(), &handle.data_type)?;
                        file_fields.insert(handle.physical_name.as_str(), field.clone());
                        read_columns.push(field.name().clone());
                        ColumnOrigin::File(read_columns.len() - 1)
                    }
                    None => ColumnOrigin::Constant(new_null_array(&handle.data_type, 1)),
                },
                ColumnKind::PartitionKey => match partition_values.remove(&index) {
                    Some(value) => ColumnOrigin::Constant(value),
                    None => ColumnOrigin::Constant(new_null_array(&handle.data_type, 1)),
                },
                ColumnKind::Synthesized(column) => {
                    ColumnOrigin::Constant(synthesized_value(column, split, &file_info))
                }
                ColumnKind::RowIndex => ColumnOrigin::RowIndex,
                ColumnKind::RowId => match &split.row_id {
                    Some(properties) => ColumnOrigin::RowId(properties.clone()),
                    None => {
                        return Err(Error::internal(
                            "Row id properties disappeared",
                            location!(),
                        ))
                    }
                },
            };
            origins.push(origin);
        }

        let mut file_filters = SubfieldFilters::new();
        for (subfield, condition) in filters {
            let handle = projection
                .columns()
                .iter()
                .find(|c| c.physical_name == subfield.root)
                .ok_or_else(|| {
                    Error::invalid_input(
                        format!("Filter references unknown column {}", subfield.root),
                        location!(),
                    )
                })?;
            match handle.kind {
                ColumnKind::Regular => {}
                // Already checked before the file was opened
                ColumnKind::PartitionKey => continue,
                _ => {
                    return Err(Error::internal(
                        format!("Filter on {} cannot be evaluated by a reader", subfield),
                        location!(),
                    ))
                }
            }
            match file_fields.get(handle.physical_name.as_str()) {
                Some(field) => {
                    let file_type = subfield_type(field.data_type(), &subfield.path)?;
                    file_filters.insert(
                        subfield.with_root(field.name().as_str()),
                        condition.clone().cast_to(&file_type)?,
                    );
                }
                // Every row reads as null
                None if condition.accepts_null() => {}
                None => {
                    log::debug!(
                        "Skipping split {}: column {} is missing from the file",
                        split,
                        handle.physical_name
                    );
                    ScanMetrics::add(&metrics.skipped_splits, 1);
                    return Ok(None);
                }
            }
        }

        let mut skipper = StatsSkipper::new(&file_filters, config.stats_filter_reorder);
        if let Some(file_stats) = reader.file_statistics() {
            if skipper.can_skip(file_stats) {
                log::debug!("Skipping split {} based on file statistics", split);
                ScanMetrics::add(&metrics.skipped_splits, 1);
                return Ok(None);
            }
        }

        let num_row_groups = reader.row_groups().len();
        if num_row_groups == 0 {
            log::debug!("Split {} does not own any row group", split);
            return Ok(None);
        }
        let row_groups = if skipper.is_empty() {
            (0..num_row_groups).collect()
        } else {
            let stats = reader.row_group_statistics().await?;
            let kept = skipper.prune_row_groups(&stats);
            ScanMetrics::add(
                &metrics.skipped_strides,
                (num_row_groups - kept.len()) as u64,
            );
            kept
        };
        log::debug!(
            "Opened split {}: reading {} of {} row groups",
            split,
            row_groups.len(),
            num_row_groups
        );

        Ok(Some(OpenSplit {
            reader,
            origins,
            read_columns,
            filters: file_filters,
            row_groups,
            position: 0,
            row: 0,
        }))
    }

    /// Produce the next batch with at least one row
    ///
    /// Returns [`SourceOutput::Yield`] once the sizer's time budget is spent, but only
    /// after at least one read so that every call makes progress. Cancellation is
    /// reported as [`Error::Cancelled`] even if a read failed at the same time.
    pub async fn next_batch(
        &mut self,
        sizer: &mut BatchSizer,
        cancel: &CancellationToken,
    ) -> Result<SourceOutput> {
        let result = self.read_next(sizer, cancel).await;
        result.map_err(|e| {
            if e.is_cancelled() {
                e
            } else {
                e.in_split(self.split.path.to_string())
            }
        })
    }

    async fn read_next(
        &mut self,
        sizer: &mut BatchSizer,
        cancel: &CancellationToken,
    ) -> Result<SourceOutput> {
        let Some(open) = self.open.as_mut() else {
            return Ok(SourceOutput::Exhausted);
        };
        let context = &self.context;
        let metrics = &context.metrics;
        let check_interval = context.config.cancellation_check_interval.max(1);
        let mut did_read = false;
        loop {
            self.steps += 1;
            if self.steps % check_interval == 0 && cancel.is_cancelled() {
                return Err(Error::cancelled(location!()));
            }
            if did_read && sizer.time_budget_exceeded() {
                return Ok(SourceOutput::Yield);
            }
            let Some(&row_group) = open.row_groups.get(open.position) else {
                return Ok(SourceOutput::Exhausted);
            };
            let info = open.reader.row_groups()[row_group];
            if open.row >= info.num_rows {
                open.position += 1;
                open.row = 0;
                continue;
            }

            let target = sizer.next_batch_rows(info.num_rows - open.row);
            let rows = open.row..open.row + target;
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled(location!())),
                read = open.reader.read_rows(row_group, rows.clone(), &open.read_columns, &open.filters) => read,
            };
            let read = match read {
                Ok(read) => read,
                Err(_) if cancel.is_cancelled() => return Err(Error::cancelled(location!())),
                Err(e) => return Err(e),
            };
            did_read = true;
            open.row = rows.end;

            let row_bytes: usize = read.columns.iter().map(|c| c.estimated_row_bytes()).sum();
            sizer.hint_row_bytes(row_bytes as u64);
            ScanMetrics::add(&metrics.raw_input_rows, target as u64);
            ScanMetrics::add(&metrics.raw_input_bytes, (row_bytes * target) as u64);
            ScanMetrics::add(&metrics.input_rows, read.passing.len() as u64);
            if read.passing.is_empty() {
                sizer.record_batch(0, 0);
                continue;
            }

            let mut batch =
                open.build_batch(&context.projection, &self.version, &info, &rows, read)?;
            context.residual.apply(&mut batch)?;
            if batch.num_rows() == 0 {
                sizer.record_batch(0, 0);
                continue;
            }
            ScanMetrics::add(&metrics.output_rows, batch.num_rows() as u64);
            sizer.record_batch(batch.num_rows(), batch.memory_size() as u64);
            return Ok(SourceOutput::Batch(batch));
        }
    }
}

fn synthesized_value(column: SynthesizedColumn, split: &Split, info: &FileInfo) -> ArrayRef {
    match column {
        SynthesizedColumn::Path => Arc::new(StringArray::from(vec![split.path.to_string()])),
        SynthesizedColumn::FileSize => Arc::new(Int64Array::from(vec![
            split.file_size.unwrap_or(info.size) as i64,
        ])),
        SynthesizedColumn::FileModifiedTime => Arc::new(Int64Array::from(vec![split
            .modified_time
            .unwrap_or(info.last_modified)
            .timestamp_millis()])),
        SynthesizedColumn::Bucket => Arc::new(Int32Array::from(vec![split.bucket])),
    }
}

/// A single value repeated on every row
#[derive(Debug)]
struct ConstantLoader(ArrayRef);

impl ColumnLoader for ConstantLoader {
    fn data_type(&self) -> &DataType {
        self.0.data_type()
    }

    fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
        Ok(ColumnVector::constant(self.0.clone(), selection.len()))
    }
}

#[derive(Debug)]
struct RowIndexLoader {
    first_row: u64,
}

impl RowIndexLoader {
    fn row_numbers(&self, selection: &RowSelection) -> Int64Array {
        Int64Array::from_iter_values(
            selection
                .iter()
                .map(|offset| (self.first_row + offset as u64) as i64),
        )
    }
}

impl ColumnLoader for RowIndexLoader {
    fn data_type(&self) -> &DataType {
        &ROW_INDEX_TYPE
    }

    fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
        Ok(ColumnVector::Flat(Arc::new(self.row_numbers(selection))))
    }
}

#[derive(Debug)]
struct RowIdLoader {
    first_row: u64,
    properties: RowIdProperties,
}

impl ColumnLoader for RowIdLoader {
    fn data_type(&self) -> &DataType {
        &ROW_ID_TYPE
    }

    fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
        let num_rows = selection.len();
        let row_numbers = RowIndexLoader {
            first_row: self.first_row,
        }
        .row_numbers(selection);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(row_numbers),
            Arc::new(Int64Array::from(vec![
                self.properties.metadata_version;
                num_rows
            ])),
            Arc::new(Int64Array::from(vec![self.properties.partition_id; num_rows])),
            Arc::new(StringArray::from(vec![
                self.properties.table_guid.as_str();
                num_rows
            ])),
        ];
        let array = StructArray::try_new(ROW_ID_FIELDS.clone(), columns, None)?;
        Ok(ColumnVector::Flat(Arc::new(array)))
    }

    fn estimated_row_bytes(&self) -> usize {
        24 + self.properties.table_guid.len()
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_array::RecordBatch;
    use arrow_schema::{Field, Schema};
    use strata_io::scheduler::IoExecutor;

    use super::*;
    use crate::column::ColumnResolver;
    use crate::expr::{col, lit};
    use crate::filter::{FilterCondition, Subfield};
    use crate::testing::{MemoryFormat, WriteOptions};

    fn int_batch(columns: Vec<(&str, Vec<i64>)>) -> RecordBatch {
        let schema = Schema::new(
            columns
                .iter()
                .map(|(name, _)| Field::new(*name, DataType::Int64, true))
                .collect::<Vec<_>>(),
        );
        let arrays = columns
            .into_iter()
            .map(|(_, values)| Arc::new(Int64Array::from(values)) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(schema), arrays).unwrap()
    }

    fn context(
        format: Arc<MemoryFormat>,
        resolver: ColumnResolver,
        output: Schema,
        residual: Option<Expr>,
        config: ScanConfig,
    ) -> Arc<ScanContext> {
        let projection = Arc::new(resolver.resolve(&output).unwrap());
        Arc::new(
            ScanContext::try_new(
                format,
                projection,
                residual,
                config,
                IoExecutor::new(4),
                ScanCache::no_cache(),
            )
            .unwrap(),
        )
    }

    async fn read_all(source: &mut DataSource, config: &ScanConfig) -> Vec<RecordBatch> {
        let mut sizer = BatchSizer::new(config);
        let cancel = CancellationToken::new();
        let mut batches = Vec::new();
        loop {
            sizer.start_call();
            match source.next_batch(&mut sizer, &cancel).await.unwrap() {
                SourceOutput::Batch(batch) => batches.push(batch.into_record_batch().unwrap()),
                SourceOutput::Yield => {}
                SourceOutput::Exhausted => return batches,
            }
        }
    }

    fn int_schema(names: &[&str]) -> Schema {
        Schema::new(
            names
                .iter()
                .map(|name| Field::new(*name, DataType::Int64, true))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_eager_columns() {
        let projection = ColumnResolver::default()
            .resolve(&int_schema(&["a", "b", "c"]))
            .unwrap();
        let residual = col("a")
            .eq(lit(1i64))
            .or(col("b").eq(lit(2i64)))
            .and(col("c").gt(col("a")));
        let residual = ResidualFilter::try_new(Some(residual), &projection).unwrap();
        assert_eq!(residual.conjuncts().len(), 2);
        assert_eq!(residual.eager_columns(), &[0, 1]);

        let plain = ResidualFilter::try_new(Some(col("c").gt(col("a"))), &projection).unwrap();
        assert!(plain.eager_columns().is_empty());
        assert!(ResidualFilter::try_new(Some(col("zz").is_null()), &projection).is_err());
    }

    #[tokio::test]
    async fn test_missing_column_reads_as_null() {
        let format = Arc::new(MemoryFormat::new());
        format
            .write_file(
                "t/f0",
                &[int_batch(vec![("a", vec![1, 2, 3])])],
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let config = ScanConfig::default();
        let context = context(
            format,
            ColumnResolver::default(),
            int_schema(&["a", "b"]),
            None,
            config.clone(),
        );

        let mut source = DataSource::open(
            Split::new("t/f0"),
            context.clone(),
            Arc::new(SubfieldFilters::new()),
        )
        .await
        .unwrap();
        let batches = read_all(&mut source, &config).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].column(1).null_count(), 3);

        // A value filter on a column that is all null rules out the split
        let filters = SubfieldFilters::from([(
            Subfield::new("b"),
            FilterCondition::Equals(1i64.into()),
        )]);
        let source = DataSource::open(Split::new("t/f0"), context.clone(), Arc::new(filters))
            .await
            .unwrap();
        assert!(source.is_empty());
        assert_eq!(ScanMetrics::get(&context.metrics.skipped_splits), 1);
    }

    #[tokio::test]
    async fn test_residual_and_row_index() {
        let format = Arc::new(MemoryFormat::new());
        format
            .write_file(
                "t/f0",
                &[
                    int_batch(vec![("a", vec![1, 2, 3, 4])]),
                    int_batch(vec![("a", vec![5, 6, 7, 8])]),
                ],
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let config = ScanConfig::default();
        let output = Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("idx", DataType::Int64, false),
        ]);
        let residual = col("a").modulo(lit(2i64)).eq(lit(0i64));
        let context = context(
            format,
            ColumnResolver::default().with_row_index("idx"),
            output,
            Some(residual),
            config.clone(),
        );
        let mut source = DataSource::open(
            Split::new("t/f0"),
            context.clone(),
            Arc::new(SubfieldFilters::new()),
        )
        .await
        .unwrap();
        let batches = read_all(&mut source, &config).await;
        let indices: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.column(1).as_primitive::<Int64Type>().values().to_vec())
            .collect();
        assert_eq!(indices, vec![1, 3, 5, 7]);
        assert_eq!(ScanMetrics::get(&context.metrics.raw_input_rows), 8);
        assert_eq!(ScanMetrics::get(&context.metrics.input_rows), 8);
        assert_eq!(ScanMetrics::get(&context.metrics.output_rows), 4);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let format = Arc::new(MemoryFormat::new());
        let config = ScanConfig::default();
        let strict = context(
            format.clone(),
            ColumnResolver::default(),
            int_schema(&["a"]),
            None,
            config.clone(),
        );
        let err = DataSource::open(
            Split::new("t/gone"),
            strict,
            Arc::new(SubfieldFilters::new()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingResource);
        assert_eq!(err.split_path(), Some("t/gone"));

        let lenient = context(
            format,
            ColumnResolver::default(),
            int_schema(&["a"]),
            None,
            config.with_ignore_missing_files(true),
        );
        let source = DataSource::open(
            Split::new("t/gone"),
            lenient.clone(),
            Arc::new(SubfieldFilters::new()),
        )
        .await
        .unwrap();
        assert!(source.is_empty());
        assert_eq!(ScanMetrics::get(&lenient.metrics.missing_files), 1);
    }

    #[tokio::test]
    async fn test_row_id_needs_properties() {
        let format = Arc::new(MemoryFormat::new());
        format
            .write_file(
                "t/f0",
                &[int_batch(vec![("a", vec![1])])],
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let output = Schema::new(vec![Field::new("rid", ROW_ID_TYPE.clone(), false)]);
        let context = context(
            format,
            ColumnResolver::default().with_row_id("rid"),
            output,
            None,
            ScanConfig::default(),
        );
        let err = DataSource::open(
            Split::new("t/f0"),
            context.clone(),
            Arc::new(SubfieldFilters::new()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);

        let split = Split::new("t/f0").with_row_id(RowIdProperties {
            metadata_version: 7,
            partition_id: 2,
            table_guid: "guid".to_string(),
        });
        let mut source = DataSource::open(split, context, Arc::new(SubfieldFilters::new()))
            .await
            .unwrap();
        let batches = read_all(&mut source, &ScanConfig::default()).await;
        let row_id = batches[0].column(0).as_struct();
        assert_eq!(row_id.column(1).as_primitive::<Int64Type>().value(0), 7);
        assert_eq!(row_id.column(3).as_string::<i32>().value(0), "guid");
    }
}
