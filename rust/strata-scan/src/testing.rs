// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! An in-memory file format for tests
//!
//! Files live in an `object_store` [`InMemory`] store so every read goes through
//! the real I/O path (executor, coalescing, cache, tracking). A file is a list of
//! row groups, each column chunk an Arrow IPC stream, followed by a row group
//! index and a 16 byte footer:
//!
//! ```text
//! | rg 0: chunk c0 | chunk c1 | ... | rg 1: ... | index | footer |
//! ```
//!
//! Statistics are computed from the data when the file is written. Opening a
//! split reads the footer, asking for row group statistics reads the index.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrow_array::cast::AsArray;
use arrow_array::types::UInt32Type;
use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use snafu::location;
use strata_core::{Error, Result};
use strata_io::object_reader::{CloudObjectReader, FileInfo, Reader};
use strata_io::scheduler::CoalescingReader;
use strata_io::RowSelection;

use crate::decoder::{FileFormat, OpenOptions, RowGroupInfo, SplitReader, UnitRead};
use crate::filter::{extract_subfield, PathElement, Subfield, SubfieldFilters};
use crate::lazy::{feed_runs, ColumnLoader, ColumnVector, ValueHook};
use crate::split::Split;
use crate::stats::{ColumnStatistics, UnitStatistics};

const FOOTER_SIZE: u64 = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a file is laid out when written
#[derive(Debug, Clone)]
pub struct WriteOptions {
    dictionary_columns: HashSet<String>,
    file_statistics: bool,
    row_group_statistics: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            dictionary_columns: HashSet::new(),
            file_statistics: true,
            row_group_statistics: true,
        }
    }
}

impl WriteOptions {
    /// Store `column` dictionary encoded. Only applies to chunks without nulls.
    pub fn with_dictionary(mut self, column: impl Into<String>) -> Self {
        self.dictionary_columns.insert(column.into());
        self
    }

    pub fn with_file_statistics(mut self, enabled: bool) -> Self {
        self.file_statistics = enabled;
        self
    }

    pub fn with_row_group_statistics(mut self, enabled: bool) -> Self {
        self.row_group_statistics = enabled;
        self
    }
}

#[derive(Debug)]
struct RowGroupLayout {
    info: RowGroupInfo,
    /// One byte range per column of the schema
    chunks: Vec<Range<u64>>,
    stats: UnitStatistics,
}

#[derive(Debug)]
struct MemoryFile {
    schema: SchemaRef,
    row_groups: Vec<RowGroupLayout>,
    index: Range<u64>,
    footer: Range<u64>,
    file_stats: Option<UnitStatistics>,
    row_group_stats: bool,
}

/// Calls made into the loaders of a [`MemoryFormat`]
#[derive(Debug, Default)]
pub struct LoadCounters {
    opens: AtomicUsize,
    loads: Mutex<HashMap<String, usize>>,
    hook_loads: Mutex<HashMap<String, usize>>,
}

impl LoadCounters {
    /// Splits whose footer was read
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Times values of `column` were decoded into a vector
    pub fn loads(&self, column: &str) -> usize {
        lock(&self.loads).get(column).copied().unwrap_or(0)
    }

    /// Times values of `column` were pushed into a value hook
    pub fn hook_loads(&self, column: &str) -> usize {
        lock(&self.hook_loads).get(column).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.opens.store(0, Ordering::Relaxed);
        lock(&self.loads).clear();
        lock(&self.hook_loads).clear();
    }

    fn bump(counts: &Mutex<HashMap<String, usize>>, column: &str) {
        *lock(counts).entry(column.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Reads of a path fail once this many reads of it have succeeded
    fail_after: HashMap<Path, usize>,
    reads: HashMap<Path, usize>,
    delay: Option<Duration>,
}

/// A file format backed by an in-memory object store
#[derive(Debug)]
pub struct MemoryFormat {
    store: Arc<dyn ObjectStore>,
    files: Mutex<HashMap<Path, Arc<MemoryFile>>>,
    faults: Arc<Mutex<Faults>>,
    counters: Arc<LoadCounters>,
}

impl Default for MemoryFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFormat {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            files: Mutex::new(HashMap::new()),
            faults: Arc::new(Mutex::new(Faults::default())),
            counters: Arc::new(LoadCounters::default()),
        }
    }

    pub fn counters(&self) -> &Arc<LoadCounters> {
        &self.counters
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Write a file with one row group per batch. Returns the file size.
    pub async fn write_file(
        &self,
        path: impl Into<Path>,
        row_groups: &[RecordBatch],
        options: WriteOptions,
    ) -> Result<u64> {
        let path = path.into();
        let schema = row_groups
            .first()
            .map(|batch| batch.schema())
            .ok_or_else(|| Error::invalid_input("A file needs a row group", location!()))?;

        let mut data = BytesMut::new();
        let mut layouts = Vec::with_capacity(row_groups.len());
        let mut first_row = 0;
        for (index, batch) in row_groups.iter().enumerate() {
            let offset = data.len() as u64;
            let mut chunks = Vec::with_capacity(batch.num_columns());
            let mut stats = UnitStatistics::new(batch.num_rows() as u64);
            for (field, column) in schema.fields().iter().zip(batch.columns()) {
                let encoded = if options.dictionary_columns.contains(field.name())
                    && column.null_count() == 0
                {
                    let dictionary_type = DataType::Dictionary(
                        Box::new(DataType::UInt32),
                        Box::new(column.data_type().clone()),
                    );
                    arrow_cast::cast(column.as_ref(), &dictionary_type)?
                } else {
                    column.clone()
                };
                let start = data.len() as u64;
                data.extend_from_slice(&encode_chunk(&encoded)?);
                chunks.push(start..data.len() as u64);
                record_statistics(&mut stats, Subfield::new(field.name().as_str()), column)?;
            }
            layouts.push(RowGroupLayout {
                info: RowGroupInfo {
                    index,
                    offset,
                    num_rows: batch.num_rows(),
                    first_row,
                },
                chunks,
                stats,
            });
            first_row += batch.num_rows() as u64;
        }

        let index_start = data.len() as u64;
        for layout in &layouts {
            data.put_u64_le(layout.info.offset);
            data.put_u64_le(layout.info.num_rows as u64);
        }
        let index = index_start..data.len() as u64;
        data.put_u64_le(index.start);
        data.put_u64_le(index.end - index.start);
        let size = data.len() as u64;

        let file_stats = options.file_statistics.then(|| {
            let units = layouts.iter().map(|l| l.stats.clone()).collect::<Vec<_>>();
            UnitStatistics::merge(&units)
        });
        let file = MemoryFile {
            schema,
            row_groups: layouts,
            index,
            footer: size - FOOTER_SIZE..size,
            file_stats,
            row_group_stats: options.row_group_statistics,
        };
        self.store.put(&path, data.freeze().into()).await?;
        lock(&self.files).insert(path, Arc::new(file));
        Ok(size)
    }

    /// Delete a file so that opening it fails with `NotFound`
    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        self.store.delete(path).await?;
        Ok(())
    }

    /// Reads of `path` fail after `successful_reads` reads succeeded
    pub fn fail_reads(&self, path: impl Into<Path>, successful_reads: usize) {
        lock(&self.faults)
            .fail_after
            .insert(path.into(), successful_reads);
    }

    /// Every read waits `delay` before it starts
    pub fn slow_reads(&self, delay: Duration) {
        lock(&self.faults).delay = Some(delay);
    }

    /// Byte offsets of the row groups of a file
    pub fn row_group_offsets(&self, path: &Path) -> Vec<u64> {
        lock(&self.files)
            .get(path)
            .map(|f| f.row_groups.iter().map(|rg| rg.info.offset).collect())
            .unwrap_or_default()
    }
}

fn record_statistics(stats: &mut UnitStatistics, subfield: Subfield, array: &ArrayRef) -> Result<()> {
    if let DataType::Struct(fields) = array.data_type() {
        for field in fields {
            let element = PathElement::NestedField(field.name().clone());
            // Children of null parents read as null
            let child = extract_subfield(array, std::slice::from_ref(&element))?;
            stats.columns.insert(
                subfield.clone().with_element(element),
                ColumnStatistics::from_array(&child)?,
            );
        }
        return Ok(());
    }
    if matches!(array.data_type(), DataType::List(_) | DataType::Map(_, _)) {
        return Ok(());
    }
    stats
        .columns
        .insert(subfield, ColumnStatistics::from_array(array)?);
    Ok(())
}

fn encode_chunk(array: &ArrayRef) -> Result<Bytes> {
    let schema = Arc::new(Schema::new(vec![Field::new(
        "values",
        array.data_type().clone(),
        true,
    )]));
    let batch = RecordBatch::try_new(schema.clone(), vec![array.clone()])?;
    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    drop(writer);
    Ok(Bytes::from(buffer))
}

fn decode_chunk(bytes: Bytes) -> Result<ArrayRef> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let mut arrays = Vec::new();
    for batch in reader {
        arrays.push(batch?.column(0).clone());
    }
    match arrays.len() {
        1 => Ok(arrays.remove(0)),
        n => Err(Error::io(
            format!("Column chunk holds {} batches, expected 1", n),
            location!(),
        )),
    }
}

/// A reader that injects failures and latency
#[derive(Debug)]
struct FaultyReader {
    inner: Arc<dyn Reader>,
    faults: Arc<Mutex<Faults>>,
}

#[async_trait]
impl Reader for FaultyReader {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    async fn info(&self) -> Result<FileInfo> {
        self.inner.info().await
    }

    async fn get_range(&self, range: Range<u64>) -> Result<Bytes> {
        let (delay, fail) = {
            let mut faults = lock(&self.faults);
            let path = self.inner.path().clone();
            let reads = *faults.reads.get(&path).unwrap_or(&0);
            let fail = faults.fail_after.get(&path).is_some_and(|n| reads >= *n);
            faults.reads.insert(path, reads + 1);
            (faults.delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::io(
                format!("Injected read failure for {}", self.inner.path()),
                location!(),
            ));
        }
        self.inner.get_range(range).await
    }
}

#[async_trait]
impl FileFormat for MemoryFormat {
    async fn open_split(&self, split: &Split, options: OpenOptions) -> Result<Box<dyn SplitReader>> {
        let object = CloudObjectReader::open(self.store.clone(), split.path.clone()).await?;
        let info = object.info().await?;
        let file = lock(&self.files).get(&split.path).cloned().ok_or_else(|| {
            Error::io(
                format!("{} is not a file of this format", split.path),
                location!(),
            )
        })?;
        let reader: Arc<dyn Reader> = Arc::new(FaultyReader {
            inner: Arc::new(object),
            faults: self.faults.clone(),
        });
        let reader = options.coalescing_reader(reader);

        let footer = reader.load(vec![file.footer.clone()]).await?;
        let footer = footer.first().map(|b| b.len()).unwrap_or(0);
        if footer as u64 != FOOTER_SIZE {
            return Err(Error::io(
                format!("Truncated footer in {}", split.path),
                location!(),
            ));
        }
        self.counters.opens.fetch_add(1, Ordering::Relaxed);

        let row_groups = file
            .row_groups
            .iter()
            .filter(|rg| split.owns_offset(rg.info.offset))
            .map(|rg| rg.info)
            .collect();
        Ok(Box::new(MemorySplitReader {
            path: split.path.clone(),
            file,
            info,
            row_groups,
            reader,
            counters: self.counters.clone(),
            decoded: Mutex::new(None),
        }))
    }
}

type DecodedRowGroup = (usize, HashMap<usize, ArrayRef>);

#[derive(Debug)]
struct MemorySplitReader {
    path: Path,
    file: Arc<MemoryFile>,
    info: FileInfo,
    row_groups: Vec<RowGroupInfo>,
    reader: CoalescingReader,
    counters: Arc<LoadCounters>,
    /// Chunks of the row group read last, by column index
    decoded: Mutex<Option<DecodedRowGroup>>,
}

impl MemorySplitReader {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.file.schema.index_of(name).map_err(|_| {
            Error::invalid_input(
                format!("{} has no column {}", self.path, name),
                location!(),
            )
        })
    }

    /// Chunks of the given columns, reading the ones not decoded yet
    async fn chunks(&self, row_group: &RowGroupInfo, columns: &[usize]) -> Result<Vec<ArrayRef>> {
        let mut missing = {
            let decoded = lock(&self.decoded);
            match decoded.as_ref() {
                Some((index, chunks)) if *index == row_group.index => columns
                    .iter()
                    .filter(|c| !chunks.contains_key(c))
                    .copied()
                    .collect::<Vec<_>>(),
                _ => columns.to_vec(),
            }
        };
        missing.sort_unstable();
        missing.dedup();
        let layout = &self.file.row_groups[row_group.index];
        let ranges = missing.iter().map(|c| layout.chunks[*c].clone()).collect();
        let buffers = self.reader.load(ranges).await?;
        let mut fresh = Vec::with_capacity(missing.len());
        for (column, buffer) in missing.into_iter().zip(buffers) {
            fresh.push((column, decode_chunk(buffer)?));
        }

        let mut decoded = lock(&self.decoded);
        if decoded.as_ref().is_none_or(|(index, _)| *index != row_group.index) {
            *decoded = Some((row_group.index, HashMap::new()));
        }
        let chunks = match decoded.as_mut() {
            Some((_, chunks)) => chunks,
            None => return Err(Error::internal("Decoded chunks vanished", location!())),
        };
        chunks.extend(fresh);
        columns
            .iter()
            .map(|c| {
                chunks.get(c).cloned().ok_or_else(|| {
                    Error::internal(format!("Column chunk {} was not read", c), location!())
                })
            })
            .collect()
    }
}

fn flatten(array: &ArrayRef) -> Result<ArrayRef> {
    match array.data_type() {
        DataType::Dictionary(_, value_type) => Ok(arrow_cast::cast(array.as_ref(), value_type)?),
        _ => Ok(array.clone()),
    }
}

#[async_trait]
impl SplitReader for MemorySplitReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn file_schema(&self) -> SchemaRef {
        self.file.schema.clone()
    }

    fn file_info(&self) -> FileInfo {
        self.info
    }

    fn file_statistics(&self) -> Option<&UnitStatistics> {
        self.file.file_stats.as_ref()
    }

    fn row_groups(&self) -> &[RowGroupInfo] {
        &self.row_groups
    }

    async fn row_group_statistics(&self) -> Result<Vec<UnitStatistics>> {
        self.reader.load(vec![self.file.index.clone()]).await?;
        Ok(self
            .row_groups
            .iter()
            .map(|rg| {
                if self.file.row_group_stats {
                    self.file.row_groups[rg.index].stats.clone()
                } else {
                    UnitStatistics::new(rg.num_rows as u64)
                }
            })
            .collect())
    }

    async fn read_rows(
        &self,
        row_group: usize,
        rows: Range<usize>,
        columns: &[String],
        filters: &SubfieldFilters,
    ) -> Result<UnitRead> {
        let info = *self.row_groups.get(row_group).ok_or_else(|| {
            Error::invalid_input(format!("No row group {}", row_group), location!())
        })?;
        if rows.end > info.num_rows {
            return Err(Error::invalid_input(
                format!("Rows {:?} out of a row group of {}", rows, info.num_rows),
                location!(),
            ));
        }

        let filter_columns = filters
            .keys()
            .map(|subfield| self.column_index(&subfield.root))
            .collect::<Result<Vec<_>>>()?;
        let filter_chunks = self.chunks(&info, &filter_columns).await?;
        let mut mask: Option<BooleanArray> = None;
        for ((subfield, condition), chunk) in filters.iter().zip(filter_chunks) {
            let values = flatten(&chunk.slice(rows.start, rows.len()))?;
            let values = extract_subfield(&values, &subfield.path)?;
            // Null results count as false when the selection is filtered
            let passed = condition.evaluate(values.as_ref())?;
            mask = Some(match mask {
                Some(mask) => arrow_arith::boolean::and(&mask, &passed)?,
                None => passed,
            });
        }
        let all = RowSelection::all(rows.len());
        let passing = match mask {
            Some(mask) => all.filter(&mask),
            None => all,
        };
        if passing.is_empty() {
            return Ok(UnitRead {
                passing,
                columns: vec![],
            });
        }

        let indices = columns
            .iter()
            .map(|name| self.column_index(name))
            .collect::<Result<Vec<_>>>()?;
        let chunks = self.chunks(&info, &indices).await?;
        let loaders = columns
            .iter()
            .zip(chunks)
            .map(|(name, chunk)| {
                let values = chunk.slice(rows.start, rows.len());
                let data_type = match values.data_type() {
                    DataType::Dictionary(_, value_type) => value_type.as_ref().clone(),
                    other => other.clone(),
                };
                Arc::new(MemoryColumnLoader {
                    column: name.clone(),
                    values,
                    data_type,
                    counters: self.counters.clone(),
                }) as Arc<dyn ColumnLoader>
            })
            .collect();
        Ok(UnitRead {
            passing,
            columns: loaders,
        })
    }
}

#[derive(Debug)]
struct MemoryColumnLoader {
    column: String,
    /// Plain or dictionary encoded
    values: ArrayRef,
    data_type: DataType,
    counters: Arc<LoadCounters>,
}

impl ColumnLoader for MemoryColumnLoader {
    fn data_type(&self) -> &DataType {
        &self.data_type
    }

    fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
        LoadCounters::bump(&self.counters.loads, &self.column);
        let indices = selection.to_indices();
        match self.values.data_type() {
            DataType::Dictionary(_, _) => {
                let dictionary = self.values.as_dictionary::<UInt32Type>();
                let keys = arrow_select::take::take(dictionary.keys(), &indices, None)?;
                Ok(ColumnVector::dictionary(
                    keys.as_primitive::<UInt32Type>().clone(),
                    dictionary.values().clone(),
                ))
            }
            _ => Ok(ColumnVector::Flat(arrow_select::take::take(
                self.values.as_ref(),
                &indices,
                None,
            )?)),
        }
    }

    fn load_with_hook(&self, selection: &RowSelection, hook: &mut dyn ValueHook) -> Result<bool> {
        if matches!(self.values.data_type(), DataType::Dictionary(_, _)) {
            return Ok(false);
        }
        LoadCounters::bump(&self.counters.hook_loads, &self.column);
        feed_runs(&self.values, selection, hook)?;
        Ok(true)
    }

    fn estimated_row_bytes(&self) -> usize {
        match self.values.len() {
            0 => self.data_type.primitive_width().unwrap_or(16),
            n => (self.values.get_array_memory_size() / n).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int64Array, StringArray};
    use strata_core::cache::ScanCache;
    use strata_io::scheduler::IoExecutor;

    use super::*;
    use crate::filter::FilterCondition;

    fn batch(range: Range<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("tag", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from_iter_values(range.clone())),
                Arc::new(StringArray::from_iter_values(
                    range.map(|v| if v % 2 == 0 { "even" } else { "odd" }),
                )),
            ],
        )
        .unwrap()
    }

    fn options() -> OpenOptions {
        OpenOptions::new(IoExecutor::new(4), ScanCache::with_capacity(1 << 20))
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let format = MemoryFormat::new();
        let path = Path::from("a.bin");
        format
            .write_file(
                path.clone(),
                &[batch(0..10), batch(10..20)],
                WriteOptions::default().with_dictionary("tag"),
            )
            .await
            .unwrap();

        let options = options();
        let reader = format
            .open_split(&Split::new(path.clone()), options.clone())
            .await
            .unwrap();
        assert_eq!(options.tracker.stats().read_iops, 1);
        assert_eq!(reader.row_groups().len(), 2);
        assert_eq!(reader.row_groups()[1].first_row, 10);
        let file_stats = reader.file_statistics().unwrap();
        assert_eq!(
            file_stats.column(&Subfield::new("id")).unwrap().max,
            Some(datafusion_common::ScalarValue::Int64(Some(19)))
        );

        let mut filters = SubfieldFilters::new();
        filters.insert(
            Subfield::new("tag"),
            FilterCondition::Equals(datafusion_common::ScalarValue::from("odd")),
        );
        let read = reader
            .read_rows(1, 2..8, &["id".to_string(), "tag".to_string()], &filters)
            .await
            .unwrap();
        assert_eq!(read.passing, RowSelection::from(vec![1, 3, 5]));
        let ids = read.columns[0].load(&read.passing).unwrap().to_array().unwrap();
        assert_eq!(
            ids.as_primitive::<arrow_array::types::Int64Type>(),
            &Int64Array::from(vec![13, 15, 17])
        );
        // Every passing row has the same tag
        assert!(read.columns[1].load(&read.passing).unwrap().is_constant());
        assert_eq!(format.counters().loads("id"), 1);
        assert_eq!(format.counters().loads("tag"), 1);
    }

    #[tokio::test]
    async fn test_range_past_row_groups_reads_footer_only() {
        let format = MemoryFormat::new();
        let path = Path::from("b.bin");
        let size = format
            .write_file(path.clone(), &[batch(0..10)], WriteOptions::default())
            .await
            .unwrap();
        let options = options();
        let split = Split::new(path).with_range(1..size);
        let reader = format.open_split(&split, options.clone()).await.unwrap();
        assert!(reader.row_groups().is_empty());
        assert_eq!(options.tracker.stats().read_iops, 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let format = MemoryFormat::new();
        let path = Path::from("c.bin");
        format
            .write_file(path.clone(), &[batch(0..10)], WriteOptions::default())
            .await
            .unwrap();
        format.fail_reads(path.clone(), 1);
        let reader = format
            .open_split(&Split::new(path.clone()), options())
            .await
            .unwrap();
        let err = reader
            .read_rows(0, 0..10, &["id".to_string()], &SubfieldFilters::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Injected read failure"));

        format.delete_file(&path).await.unwrap();
        let err = format
            .open_split(&Split::new(path), options())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), strata_core::ErrorKind::MissingResource);
    }
}
