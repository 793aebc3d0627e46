// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Aggregation pushdown into column decoding
//!
//! When a column is only consumed by one simple reducer, its values can be
//! folded into the reducer while they are decoded, without building a vector.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type};
use arrow_array::{Array, ArrayRef};
use arrow_cast::CastOptions;
use arrow_schema::{DataType, Schema};
use datafusion_common::ScalarValue;
use snafu::location;
use strata_core::{Error, Result};

use crate::expr::Expr;
use crate::lazy::{ScanBatch, ValueHook};
use crate::metrics::ScanMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reducer {
    Min,
    Max,
    Sum,
    BitAnd,
    BitOr,
}

impl Display for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::BitAnd => "bit_and",
            Self::BitOr => "bit_or",
        };
        write!(f, "{}", name)
    }
}

fn is_exact_integer(data_type: &DataType) -> bool {
    // UInt64 does not fit the Int64 accumulator
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
    )
}

impl Reducer {
    /// Whether the reducer gives exact results on values of `data_type`
    ///
    /// Decimals are excluded.
    pub fn supports(&self, data_type: &DataType) -> bool {
        match self {
            Self::BitAnd | Self::BitOr => is_exact_integer(data_type),
            Self::Min | Self::Max | Self::Sum => {
                is_exact_integer(data_type)
                    || matches!(data_type, DataType::Float32 | DataType::Float64)
            }
        }
    }
}

/// One aggregate over the rows of a scan
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub reducer: Reducer,
    pub input: Expr,
}

impl AggregateRequest {
    pub fn new(reducer: Reducer, input: Expr) -> Self {
        Self { reducer, input }
    }
}

/// Which aggregate requests can be computed during decoding
#[derive(Debug, Clone)]
pub struct AggregationPushdown {
    /// The column a request reads, when it is pushed
    pushed: Vec<Option<String>>,
}

impl AggregationPushdown {
    /// Decide for each request whether its reducer can be pushed into decoding
    pub fn plan(requests: &[AggregateRequest], schema: &Schema) -> Self {
        let mut uses: HashMap<String, usize> = HashMap::new();
        for request in requests {
            for column in request.input.column_refs() {
                *uses.entry(column).or_default() += 1;
            }
        }
        let pushed = requests
            .iter()
            .map(|request| {
                let Expr::Column(name) = &request.input else {
                    log::debug!("Not pushing {} of an expression", request.reducer);
                    return None;
                };
                if uses.get(name).copied().unwrap_or(0) > 1 {
                    log::debug!("Not pushing {}: {} is consumed more than once", request.reducer, name);
                    return None;
                }
                let field = schema.field_with_name(name).ok()?;
                if !request.reducer.supports(field.data_type()) {
                    log::debug!(
                        "Not pushing {} of {}: unsupported type {}",
                        request.reducer,
                        name,
                        field.data_type()
                    );
                    return None;
                }
                Some(name.clone())
            })
            .collect();
        Self { pushed }
    }

    pub fn is_pushed(&self, request: usize) -> bool {
        self.pushed.get(request).is_some_and(Option::is_some)
    }

    pub fn pushed_column(&self, request: usize) -> Option<&str> {
        self.pushed.get(request).and_then(|c| c.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Int(Option<i64>),
    Float(Option<f64>),
}

/// Running state of one reducer
#[derive(Debug, Clone)]
pub struct Accumulator {
    reducer: Reducer,
    state: State,
}

impl Accumulator {
    /// An accumulator for values of `data_type`
    pub fn try_new(reducer: Reducer, data_type: &DataType) -> Result<Self> {
        if !reducer.supports(data_type) {
            return Err(Error::not_supported(
                format!("{} of {} values", reducer, data_type),
                location!(),
            ));
        }
        let state = if is_exact_integer(data_type) {
            State::Int(None)
        } else {
            State::Float(None)
        };
        Ok(Self { reducer, state })
    }

    pub fn update(&mut self, values: &dyn Array) -> Result<()> {
        let options = CastOptions {
            safe: false,
            ..Default::default()
        };
        match &mut self.state {
            State::Int(current) => {
                let values = arrow_cast::cast_with_options(values, &DataType::Int64, &options)?;
                let values = values.as_primitive::<Int64Type>();
                let partial = match self.reducer {
                    Reducer::Min => arrow_arith::aggregate::min(values),
                    Reducer::Max => arrow_arith::aggregate::max(values),
                    Reducer::Sum => arrow_arith::aggregate::sum_checked(values)?,
                    Reducer::BitAnd => arrow_arith::aggregate::bit_and(values),
                    Reducer::BitOr => arrow_arith::aggregate::bit_or(values),
                };
                *current = match (*current, partial) {
                    (Some(a), Some(b)) => Some(match self.reducer {
                        Reducer::Min => a.min(b),
                        Reducer::Max => a.max(b),
                        Reducer::Sum => a.checked_add(b).ok_or_else(|| {
                            Error::invalid_input("Integer overflow in sum", location!())
                        })?,
                        Reducer::BitAnd => a & b,
                        Reducer::BitOr => a | b,
                    }),
                    (a, b) => a.or(b),
                };
            }
            State::Float(current) => {
                let values = arrow_cast::cast_with_options(values, &DataType::Float64, &options)?;
                let values = values.as_primitive::<Float64Type>();
                let partial = match self.reducer {
                    Reducer::Min => arrow_arith::aggregate::min(values),
                    Reducer::Max => arrow_arith::aggregate::max(values),
                    Reducer::Sum => arrow_arith::aggregate::sum(values),
                    Reducer::BitAnd | Reducer::BitOr => {
                        return Err(Error::internal(
                            "Bitwise reducer over floats",
                            location!(),
                        ))
                    }
                };
                *current = match (*current, partial) {
                    (Some(a), Some(b)) => Some(match self.reducer {
                        Reducer::Min => a.min(b),
                        Reducer::Max => a.max(b),
                        _ => a + b,
                    }),
                    (a, b) => a.or(b),
                };
            }
        }
        Ok(())
    }

    /// The result so far, null if no non-null value was seen
    pub fn evaluate(&self) -> ScalarValue {
        match self.state {
            State::Int(v) => ScalarValue::Int64(v),
            State::Float(v) => ScalarValue::Float64(v),
        }
    }
}

struct AccumulatorHook<'a>(&'a mut Accumulator);

impl ValueHook for AccumulatorHook<'_> {
    fn add_values(&mut self, values: &dyn Array) -> Result<()> {
        self.0.update(values)
    }
}

impl ScanBatch {
    /// Reduce a column over the rows of the batch
    ///
    /// A column that is not loaded yet is fed to the reducer while decoding when
    /// its loader supports it, and stays unloaded.
    pub fn aggregate(&mut self, index: usize, reducer: Reducer) -> Result<ScalarValue> {
        let mut accumulator = Accumulator::try_new(reducer, self.column(index).data_type())?;
        self.accumulate(index, &mut accumulator)?;
        Ok(accumulator.evaluate())
    }

    /// Returns true if the values went through a value hook
    fn accumulate(&mut self, index: usize, accumulator: &mut Accumulator) -> Result<bool> {
        let column = self.column(index);
        if !column.is_loaded() && column.load_with_hook(&mut AccumulatorHook(&mut *accumulator))? {
            return Ok(true);
        }
        let values: ArrayRef = self.load(index)?.to_array()?;
        accumulator.update(values.as_ref())?;
        Ok(false)
    }
}

/// Computes aggregates over the batches of a scan
#[derive(Debug)]
pub struct PartialAggregator {
    requests: Vec<AggregateRequest>,
    pushdown: AggregationPushdown,
    accumulators: Vec<Accumulator>,
    metrics: Option<Arc<ScanMetrics>>,
}

impl PartialAggregator {
    /// `schema` is the output schema of the scan
    pub fn try_new(requests: Vec<AggregateRequest>, schema: &Schema) -> Result<Self> {
        let pushdown = AggregationPushdown::plan(&requests, schema);
        let accumulators = requests
            .iter()
            .map(|request| {
                let data_type = match &request.input {
                    Expr::Column(name) => schema.field_with_name(name)?.data_type().clone(),
                    expr => {
                        let evaluated = expr.data_type(schema)?;
                        if request.reducer.supports(&evaluated) {
                            evaluated
                        } else {
                            // Other numeric results are reduced as doubles
                            match request.reducer {
                                Reducer::BitAnd | Reducer::BitOr => DataType::Int64,
                                _ => DataType::Float64,
                            }
                        }
                    }
                };
                Accumulator::try_new(request.reducer, &data_type)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            requests,
            pushdown,
            accumulators,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pushdown(&self) -> &AggregationPushdown {
        &self.pushdown
    }

    pub fn update(&mut self, batch: &mut ScanBatch) -> Result<()> {
        for (i, request) in self.requests.iter().enumerate() {
            let accumulator = &mut self.accumulators[i];
            if let Some(column) = self.pushdown.pushed_column(i) {
                let index = batch.column_index(column).ok_or_else(|| {
                    Error::invalid_input(format!("No column named {}", column), location!())
                })?;
                if batch.accumulate(index, accumulator)? {
                    if let Some(metrics) = &self.metrics {
                        ScanMetrics::add(
                            &metrics.aggregation_pushdown_rows,
                            batch.num_rows() as u64,
                        );
                    }
                }
                continue;
            }
            let values = request.input.evaluate(batch)?.into_array(batch.num_rows())?;
            accumulator.update(values.as_ref())?;
        }
        Ok(())
    }

    /// One value per request, in request order
    pub fn finish(self) -> Vec<ScalarValue> {
        self.accumulators.iter().map(Accumulator::evaluate).collect()
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Decimal128Array, Int32Array, Int64Array};
    use arrow_schema::Field;
    use rstest::rstest;
    use strata_io::RowSelection;

    use super::*;
    use crate::column::ColumnResolver;
    use crate::expr::{col, lit};
    use crate::lazy::tests::CountingLoader;
    use crate::lazy::{ColumnLoader, ColumnVector, LazyColumn, ReaderVersion};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int64, true),
            Field::new("d", DataType::Decimal128(10, 2), true),
            Field::new("f", DataType::Float64, true),
        ])
    }

    #[rstest]
    #[case::plain(vec![AggregateRequest::new(Reducer::Sum, col("a"))], vec![true])]
    #[case::shared_column(
        vec![AggregateRequest::new(Reducer::Min, col("a")), AggregateRequest::new(Reducer::Max, col("a"))],
        vec![false, false]
    )]
    #[case::expression(vec![AggregateRequest::new(Reducer::Sum, col("a").plus(lit(1i32)))], vec![false])]
    #[case::decimal(vec![AggregateRequest::new(Reducer::Max, col("d"))], vec![false])]
    #[case::bitwise_float(vec![AggregateRequest::new(Reducer::BitOr, col("f"))], vec![false])]
    #[case::independent(
        vec![AggregateRequest::new(Reducer::Min, col("a")), AggregateRequest::new(Reducer::BitAnd, col("b"))],
        vec![true, true]
    )]
    fn test_plan(#[case] requests: Vec<AggregateRequest>, #[case] expected: Vec<bool>) {
        let plan = AggregationPushdown::plan(&requests, &schema());
        let pushed = (0..requests.len()).map(|i| plan.is_pushed(i)).collect::<Vec<_>>();
        assert_eq!(pushed, expected);
    }

    /// A loader that can also feed a value hook
    #[derive(Debug)]
    struct HookLoader(Arc<CountingLoader>);

    impl ColumnLoader for HookLoader {
        fn data_type(&self) -> &DataType {
            self.0.data_type()
        }

        fn load(&self, selection: &RowSelection) -> Result<ColumnVector> {
            self.0.load(selection)
        }

        fn load_with_hook(&self, selection: &RowSelection, hook: &mut dyn ValueHook) -> Result<bool> {
            crate::lazy::feed_runs(&self.0.values, selection, hook)?;
            Ok(true)
        }
    }

    fn batch(values: Vec<Option<i64>>, hook: bool) -> (ScanBatch, Arc<CountingLoader>) {
        let len = values.len();
        let counting = CountingLoader::new(Arc::new(Int64Array::from(values)));
        let loader: Arc<dyn ColumnLoader> = if hook {
            Arc::new(HookLoader(counting.clone()))
        } else {
            counting.clone()
        };
        let projection = ColumnResolver::default()
            .resolve(&Schema::new(vec![Field::new("b", DataType::Int64, true)]))
            .unwrap();
        let version = ReaderVersion::default();
        let column = LazyColumn::new(
            loader,
            DataType::Int64,
            RowSelection::from(vec![0, 2, 3]),
            version.stamp(),
        );
        (
            ScanBatch::new(Arc::new(projection), vec![column], 3),
            counting,
        )
    }

    #[test]
    fn test_aggregate_without_loading() {
        let (mut scan_batch, counting) = batch(vec![Some(5), Some(100), None, Some(-3)], true);
        assert_eq!(
            scan_batch.aggregate(0, Reducer::Sum).unwrap(),
            ScalarValue::Int64(Some(2))
        );
        assert_eq!(
            scan_batch.aggregate(0, Reducer::BitOr).unwrap(),
            ScalarValue::Int64(Some(5 | -3))
        );
        assert!(!scan_batch.is_loaded(0));
        assert_eq!(counting.loads(), 0);

        // Without hook support the column is loaded
        let (mut scan_batch, counting) = batch(vec![Some(5), Some(100), None, Some(-3)], false);
        assert_eq!(
            scan_batch.aggregate(0, Reducer::Min).unwrap(),
            ScalarValue::Int64(Some(-3))
        );
        assert_eq!(counting.loads(), 1);
    }

    #[test]
    fn test_partial_aggregator_counts_pushdown_rows() {
        let metrics = Arc::new(ScanMetrics::default());
        let schema = Schema::new(vec![Field::new("b", DataType::Int64, true)]);
        let mut aggregator = PartialAggregator::try_new(
            vec![AggregateRequest::new(Reducer::Max, col("b"))],
            &schema,
        )
        .unwrap()
        .with_metrics(metrics.clone());
        for _ in 0..2 {
            let (mut scan_batch, _) = batch(vec![Some(1), Some(9), Some(4), Some(7)], true);
            aggregator.update(&mut scan_batch).unwrap();
        }
        assert_eq!(ScanMetrics::get(&metrics.aggregation_pushdown_rows), 6);
        assert_eq!(aggregator.finish(), vec![ScalarValue::Int64(Some(7))]);
    }

    #[test]
    fn test_integer_expression_sums_exactly() {
        let schema = Schema::new(vec![Field::new("b", DataType::Int64, true)]);
        let mut aggregator = PartialAggregator::try_new(
            vec![
                AggregateRequest::new(Reducer::Sum, col("b").plus(lit(0i64))),
                AggregateRequest::new(Reducer::Max, col("b").multiply(lit(1i64))),
            ],
            &schema,
        )
        .unwrap();
        let big = (1i64 << 53) + 1;
        let (mut scan_batch, _) = batch(vec![Some(big), Some(100), Some(2), Some(-2)], false);
        aggregator.update(&mut scan_batch).unwrap();
        assert_eq!(
            aggregator.finish(),
            vec![ScalarValue::Int64(Some(big)), ScalarValue::Int64(Some(big))]
        );

        // Results no reducer handles exactly fall back to doubles
        let schema = Schema::new(vec![Field::new("d", DataType::Decimal128(10, 2), true)]);
        let aggregator = PartialAggregator::try_new(
            vec![AggregateRequest::new(Reducer::Sum, col("d").plus(lit(1i64)))],
            &schema,
        )
        .unwrap();
        assert_eq!(aggregator.finish(), vec![ScalarValue::Float64(None)]);
    }

    #[test]
    fn test_accumulator_types() {
        let mut acc = Accumulator::try_new(Reducer::Sum, &DataType::Int32).unwrap();
        acc.update(&Int32Array::from(vec![Some(1), None, Some(2)])).unwrap();
        acc.update(&Int32Array::from(vec![None::<i32>])).unwrap();
        assert_eq!(acc.evaluate(), ScalarValue::Int64(Some(3)));

        let mut acc = Accumulator::try_new(Reducer::Max, &DataType::Int64).unwrap();
        acc.update(&Int64Array::from(vec![None::<i64>])).unwrap();
        assert_eq!(acc.evaluate(), ScalarValue::Int64(None));

        let decimal = Decimal128Array::from(vec![1]).with_precision_and_scale(10, 2).unwrap();
        assert!(Accumulator::try_new(Reducer::Sum, decimal.data_type()).is_err());
    }
}
