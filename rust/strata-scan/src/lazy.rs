// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Deferred column materialization
//!
//! A batch coming out of a data source holds one [`LazyColumn`] per output
//! column. Nothing is decoded until a column is accessed, and what is decoded
//! keeps its storage encoding (dictionary or constant) until the batch is
//! converted into a [`RecordBatch`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{new_empty_array, Array, ArrayRef, RecordBatch, RecordBatchOptions, UInt32Array};
use arrow_schema::{DataType, SchemaRef};
use snafu::location;
use strata_arrow::MemoryAccumulator;
use strata_core::{Error, Result};
use strata_io::RowSelection;

use crate::column::ScanProjection;
use crate::expr::ColumnSource;

/// A materialized column, possibly still in its storage encoding
#[derive(Debug, Clone)]
pub enum ColumnVector {
    Flat(ArrayRef),
    /// `keys[i]` is the position in `base` of row `i`
    Dictionary { keys: UInt32Array, base: ArrayRef },
    /// `len` repetitions of `base[index]`
    Constant {
        base: ArrayRef,
        index: usize,
        len: usize,
    },
}

impl ColumnVector {
    /// A dictionary vector. Collapses to a constant when every key is the same.
    pub fn dictionary(keys: UInt32Array, base: ArrayRef) -> Self {
        let values = keys.values();
        if let Some(first) = values.first() {
            if values.iter().all(|k| k == first) {
                return Self::Constant {
                    base,
                    index: *first as usize,
                    len: values.len(),
                };
            }
        }
        Self::Dictionary { keys, base }
    }

    /// `len` repetitions of a single value
    pub fn constant(value: ArrayRef, len: usize) -> Self {
        Self::Constant {
            base: value,
            index: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Flat(array) => array.len(),
            Self::Dictionary { keys, .. } => keys.len(),
            Self::Constant { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> &DataType {
        match self {
            Self::Flat(array) => array.data_type(),
            Self::Dictionary { base, .. } | Self::Constant { base, .. } => base.data_type(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }

    pub fn is_dictionary(&self) -> bool {
        matches!(self, Self::Dictionary { .. })
    }

    /// Keep the rows at `positions`, preserving the encoding
    pub fn take(&self, positions: &UInt32Array) -> Result<Self> {
        // Positions are recomputed per batch, anything past the end is a bug upstream
        if let Some(max) = positions.values().iter().max() {
            if *max as usize >= self.len() {
                return Err(Error::internal(
                    format!(
                        "Position {} is out of bounds for a vector of {} rows",
                        max,
                        self.len()
                    ),
                    location!(),
                ));
            }
        }
        Ok(match self {
            Self::Flat(array) => {
                Self::Flat(arrow_select::take::take(array.as_ref(), positions, None)?)
            }
            Self::Dictionary { keys, base } => {
                let keys = UInt32Array::from_iter_values(
                    positions.values().iter().map(|p| keys.value(*p as usize)),
                );
                Self::dictionary(keys, base.clone())
            }
            Self::Constant { base, index, .. } => Self::Constant {
                base: base.clone(),
                index: *index,
                len: positions.len(),
            },
        })
    }

    /// Cast the values, keeping dictionary and constant wrapping around the cast base
    pub fn cast(&self, data_type: &DataType) -> Result<Self> {
        if self.data_type() == data_type {
            return Ok(self.clone());
        }
        let cast = |array: &ArrayRef| arrow_cast::cast(array.as_ref(), data_type);
        Ok(match self {
            Self::Flat(array) => Self::Flat(cast(array)?),
            Self::Dictionary { keys, base } => Self::Dictionary {
                keys: keys.clone(),
                base: cast(base)?,
            },
            Self::Constant { base, index, len } => Self::Constant {
                base: cast(base)?,
                index: *index,
                len: *len,
            },
        })
    }

    /// Flatten into a plain array
    pub fn to_array(&self) -> Result<ArrayRef> {
        match self {
            Self::Flat(array) => Ok(array.clone()),
            Self::Dictionary { keys, base } => Ok(arrow_select::take::take(base.as_ref(), keys, None)?),
            Self::Constant { base, index, len } => {
                if *len == 0 {
                    return Ok(new_empty_array(base.data_type()));
                }
                let keys = UInt32Array::from(vec![*index as u32; *len]);
                Ok(arrow_select::take::take(base.as_ref(), &keys, None)?)
            }
        }
    }

    pub fn record_memory(&self, accumulator: &mut MemoryAccumulator) {
        match self {
            Self::Flat(array) => accumulator.record_array(array.as_ref()),
            Self::Dictionary { keys, base } => {
                accumulator.record_array(keys);
                accumulator.record_array(base.as_ref());
            }
            Self::Constant { base, .. } => accumulator.record_array(base.as_ref()),
        }
    }
}

/// Receives the values of a column without them being collected into a vector
pub trait ValueHook: Send {
    /// Called with consecutive runs of selected values
    fn add_values(&mut self, values: &dyn Array) -> Result<()>;
}

/// Feed the rows of `values` picked by `selection` to `hook`, one contiguous run at a time
pub fn feed_runs(values: &ArrayRef, selection: &RowSelection, hook: &mut dyn ValueHook) -> Result<()> {
    match selection {
        RowSelection::Range(range) => hook.add_values(values.slice(range.start, range.len()).as_ref()),
        RowSelection::Indices(_) => {
            let mut run: Option<(usize, usize)> = None;
            for row in selection.iter() {
                let row = row as usize;
                run = match run {
                    Some((start, end)) if end == row => Some((start, end + 1)),
                    Some((start, end)) => {
                        hook.add_values(values.slice(start, end - start).as_ref())?;
                        Some((row, row + 1))
                    }
                    None => Some((row, row + 1)),
                };
            }
            if let Some((start, end)) = run {
                hook.add_values(values.slice(start, end - start).as_ref())?;
            }
            Ok(())
        }
    }
}

/// Decodes one column of one storage unit
pub trait ColumnLoader: Debug + Send + Sync {
    /// The type the values are decoded as
    fn data_type(&self) -> &DataType;

    /// Decode the rows at `selection` (offsets within the unit)
    fn load(&self, selection: &RowSelection) -> Result<ColumnVector>;

    /// Push the selected values into `hook` instead of decoding a vector.
    ///
    /// Returns false if the loader cannot do this, in which case nothing was
    /// pushed and the caller falls back to [`Self::load`].
    fn load_with_hook(&self, _selection: &RowSelection, _hook: &mut dyn ValueHook) -> Result<bool> {
        Ok(false)
    }

    /// Estimated decoded size of one row, used before anything has been loaded
    fn estimated_row_bytes(&self) -> usize {
        self.data_type().primitive_width().unwrap_or(16)
    }
}

/// Counter bumped each time a reader hands out a new batch.
///
/// Loaders of a batch are only valid until the reader moves on.
#[derive(Debug, Clone, Default)]
pub struct ReaderVersion(Arc<AtomicU64>);

impl ReaderVersion {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate every column handed out so far
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            created: self.current(),
            reader: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionStamp {
    created: u64,
    reader: ReaderVersion,
}

impl VersionStamp {
    fn check(&self) -> Result<()> {
        let current = self.reader.current();
        if current != self.created {
            return Err(Error::internal(
                format!(
                    "Lazy column created at version {} was loaded after the reader has moved to version {}",
                    self.created, current
                ),
                location!(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum LazyState {
    Unloaded,
    Loaded {
        selection: RowSelection,
        vector: ColumnVector,
    },
}

/// A column whose values are decoded on first access
///
/// The column stands for the rows of its current selection. Narrowing the
/// selection after a load derives the new vector from the loaded one; any
/// other change of selection loads again.
#[derive(Debug, Clone)]
pub struct LazyColumn {
    loader: Arc<dyn ColumnLoader>,
    data_type: DataType,
    selection: RowSelection,
    stamp: VersionStamp,
    state: LazyState,
}

impl LazyColumn {
    pub fn new(
        loader: Arc<dyn ColumnLoader>,
        data_type: DataType,
        selection: RowSelection,
        stamp: VersionStamp,
    ) -> Self {
        Self {
            loader,
            data_type,
            selection,
            stamp,
            state: LazyState::Unloaded,
        }
    }

    /// Whether the values for the current selection are available without loading
    pub fn is_loaded(&self) -> bool {
        match &self.state {
            LazyState::Unloaded => false,
            LazyState::Loaded { selection, .. } => self.selection.is_subset_of(selection),
        }
    }

    fn holds_current_selection(&self) -> bool {
        matches!(&self.state, LazyState::Loaded { selection, .. } if selection == &self.selection)
    }

    pub fn selection(&self) -> &RowSelection {
        &self.selection
    }

    pub fn len(&self) -> usize {
        self.selection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selection.is_empty()
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn loader(&self) -> &Arc<dyn ColumnLoader> {
        &self.loader
    }

    /// Bind the column to another set of rows of the same unit. Nothing is loaded.
    pub fn select(&mut self, selection: RowSelection) {
        self.selection = selection;
    }

    /// The values of the current selection, loading them if needed
    pub fn load(&mut self) -> Result<&ColumnVector> {
        if !self.holds_current_selection() {
            let vector = self.vector_for(&self.selection.clone())?;
            self.state = LazyState::Loaded {
                selection: self.selection.clone(),
                vector,
            };
        }
        match &self.state {
            LazyState::Loaded { vector, .. } => Ok(vector),
            LazyState::Unloaded => Err(Error::internal(
                "Lazy column is not loaded after a load",
                location!(),
            )),
        }
    }

    fn vector_for(&self, selection: &RowSelection) -> Result<ColumnVector> {
        if let LazyState::Loaded {
            selection: loaded,
            vector,
        } = &self.state
        {
            if loaded == selection {
                return Ok(vector.clone());
            }
            if let Some(positions) = selection.positions_in(loaded) {
                return vector.take(&positions);
            }
        }
        self.stamp.check()?;
        self.loader.load(selection)?.cast(&self.data_type)
    }

    /// Push the values of the current selection into `hook` without keeping a vector.
    ///
    /// Returns false if the loader has no hook support.
    pub fn load_with_hook(&self, hook: &mut dyn ValueHook) -> Result<bool> {
        self.stamp.check()?;
        if self.loader.data_type() != &self.data_type {
            return Ok(false);
        }
        self.loader.load_with_hook(&self.selection, hook)
    }

    /// Bytes per row of the loaded values, or an estimate if nothing is loaded
    pub fn record_memory(&self, accumulator: &mut MemoryAccumulator) {
        match &self.state {
            LazyState::Loaded { vector, .. } => vector.record_memory(accumulator),
            LazyState::Unloaded => {
                accumulator.record_estimate(self.loader.estimated_row_bytes() * self.len())
            }
        }
    }
}

/// A batch of rows from one storage unit, with lazily loaded columns
///
/// Holds one column per entry of its [`ScanProjection`], hidden columns
/// included. Only the output columns end up in [`Self::into_record_batch`].
#[derive(Debug, Clone)]
pub struct ScanBatch {
    projection: Arc<ScanProjection>,
    columns: Vec<LazyColumn>,
    num_rows: usize,
}

impl ScanBatch {
    pub fn new(projection: Arc<ScanProjection>, columns: Vec<LazyColumn>, num_rows: usize) -> Self {
        Self {
            projection,
            columns,
            num_rows,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        self.projection.schema()
    }

    pub fn projection(&self) -> &Arc<ScanProjection> {
        &self.projection
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> &LazyColumn {
        &self.columns[index]
    }

    pub fn column_mut(&mut self, index: usize) -> &mut LazyColumn {
        &mut self.columns[index]
    }

    /// Index of a column by output or physical name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.projection.lookup(name).map(|(index, _)| index)
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.columns[index].is_loaded()
    }

    pub fn load(&mut self, index: usize) -> Result<&ColumnVector> {
        self.columns[index].load()
    }

    /// The rows of the unit this batch stands for
    pub fn selection(&self) -> Option<&RowSelection> {
        self.columns.first().map(|c| c.selection())
    }

    /// Restrict every column to `selection`
    pub fn select(&mut self, selection: RowSelection) {
        self.num_rows = selection.len();
        for column in &mut self.columns {
            column.select(selection.clone());
        }
    }

    /// Approximate materialized size of the batch in bytes
    pub fn memory_size(&self) -> usize {
        let mut accumulator = MemoryAccumulator::default();
        for column in &self.columns {
            column.record_memory(&mut accumulator);
        }
        accumulator.total()
    }

    /// Load every output column and flatten it
    pub fn into_record_batch(mut self) -> Result<RecordBatch> {
        let num_output = self.projection.num_output_columns();
        let mut arrays = Vec::with_capacity(num_output);
        for column in self.columns.iter_mut().take(num_output) {
            arrays.push(column.load()?.to_array()?);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(self.num_rows));
        Ok(RecordBatch::try_new_with_options(
            self.projection.schema().clone(),
            arrays,
            &options,
        )?)
    }
}

impl ColumnSource for ScanBatch {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn column(&mut self, name: &str) -> Result<ArrayRef> {
        let index = self.column_index(name).ok_or_else(|| {
            Error::invalid_input(format!("No column named {}", name), location!())
        })?;
        self.columns[index].load()?.to_array()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use arrow_array::cast::AsArray;
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{Field, Schema};

    use super::*;
    use crate::column::ColumnResolver;

    /// A loader over an in-memory array that counts how often it runs
    #[derive(Debug)]
    pub(crate) struct CountingLoader {
        pub values: ArrayRef,
        pub loads: AtomicUsize,
    }

    impl CountingLoader {
        pub(crate) fn new(values: ArrayRef) -> Arc<Self> {
            Arc::new(Self {
                values,
                loads: AtomicUsize::new(0),
            })
        }

        pub(crate) fn loads(&self) -> usize {
            self.loads.load(Ordering::Relaxed)
        }
    }

    impl ColumnLoader for CountingLoader {
        fn data_type(&self) -> &DataType {
            self.values.data_type()
        }

        fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(ColumnVector::Flat(arrow_select::take::take(
                self.values.as_ref(),
                &selection.to_indices(),
                None,
            )?))
        }
    }

    #[test]
    fn test_dictionary_collapses_to_constant() {
        let base: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "c"]));
        let dict = ColumnVector::dictionary(UInt32Array::from(vec![0, 1, 1, 2, 1]), base);
        assert!(dict.is_dictionary());

        // Selecting rows that share one code keeps the base, no flat copy
        let narrowed = dict.take(&UInt32Array::from(vec![1, 2, 4])).unwrap();
        assert!(narrowed.is_constant());
        assert_eq!(narrowed.len(), 3);
        assert_eq!(
            narrowed.to_array().unwrap().as_string::<i32>(),
            &StringArray::from(vec!["b", "b", "b"])
        );

        let kept = dict.take(&UInt32Array::from(vec![0, 3])).unwrap();
        assert!(kept.is_dictionary());
        assert_eq!(
            kept.to_array().unwrap().as_string::<i32>(),
            &StringArray::from(vec!["a", "c"])
        );
    }

    #[test]
    fn test_constant_bounds_are_per_vector() {
        let base: ArrayRef = Arc::new(Int64Array::from(vec![7]));
        let constant = ColumnVector::constant(base, 2);
        assert!(constant.take(&UInt32Array::from(vec![1])).is_ok());
        // An index buffer from a longer batch must not be applied
        let err = constant.take(&UInt32Array::from(vec![0, 5])).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_lazy_reuse_and_reload() {
        let values: ArrayRef = Arc::new(Int64Array::from_iter_values(0..10));
        let loader = CountingLoader::new(values);
        let version = ReaderVersion::default();
        let mut column = LazyColumn::new(
            loader.clone(),
            DataType::Int64,
            RowSelection::all(10),
            version.stamp(),
        );
        assert!(!column.is_loaded());
        assert_eq!(column.load().unwrap().len(), 10);
        column.load().unwrap();
        assert_eq!(loader.loads(), 1);

        // A subset is derived from what is loaded
        column.select(RowSelection::from(vec![2, 4, 6]));
        assert!(column.is_loaded());
        let narrowed = column.load().unwrap().to_array().unwrap();
        assert_eq!(
            narrowed.as_primitive::<arrow_array::types::Int64Type>(),
            &Int64Array::from(vec![2, 4, 6])
        );
        assert_eq!(loader.loads(), 1);

        // A different selection has to load again
        column.select(RowSelection::from(vec![1, 3]));
        assert!(!column.is_loaded());
        let reloaded = column.load().unwrap().to_array().unwrap();
        assert_eq!(
            reloaded.as_primitive::<arrow_array::types::Int64Type>(),
            &Int64Array::from(vec![1, 3])
        );
        assert_eq!(loader.loads(), 2);
    }

    #[test]
    fn test_load_after_reader_moved() {
        let loader = CountingLoader::new(Arc::new(Int64Array::from(vec![1, 2])));
        let version = ReaderVersion::default();
        let mut column = LazyColumn::new(
            loader,
            DataType::Int64,
            RowSelection::all(2),
            version.stamp(),
        );
        version.advance();
        let err = column.load().unwrap_err();
        assert!(err.to_string().contains("reader has moved"));
    }

    #[test]
    fn test_into_record_batch_casts() {
        let loader = CountingLoader::new(Arc::new(arrow_array::Int32Array::from(vec![1, 2, 3])));
        let version = ReaderVersion::default();
        let projection = ColumnResolver::default()
            .resolve(&Schema::new(vec![Field::new("a", DataType::Int64, true)]))
            .unwrap();
        let column = LazyColumn::new(
            loader,
            DataType::Int64,
            RowSelection::from(vec![0, 2]),
            version.stamp(),
        );
        let batch = ScanBatch::new(Arc::new(projection), vec![column], 2);
        assert!(batch.memory_size() > 0);
        let batch = batch.into_record_batch().unwrap();
        assert_eq!(
            batch.column(0).as_primitive::<arrow_array::types::Int64Type>(),
            &Int64Array::from(vec![1, 3])
        );
    }
}
