// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vectorized, pull based table scan.
//!
//! Splits are queued on a [`SplitScheduler`] and read by [`TableScan`]s. Filters
//! are compiled into per subfield conditions pushed into the file reader and a
//! residual expression evaluated on lazily loaded columns. Statistics at file
//! and row group level skip data that cannot match.
//!
//! File formats plug in through [`decoder::FileFormat`]. [`testing::MemoryFormat`]
//! is a small format backed by an in-memory object store.

pub mod aggregate;
pub mod batch_size;
pub mod column;
pub mod compiler;
pub mod config;
pub mod decoder;
pub mod expr;
pub mod filter;
pub mod lazy;
pub mod metrics;
pub mod scheduler;
pub mod source;
pub mod split;
pub mod stats;
pub mod table_scan;
pub mod testing;

pub use column::{ColumnHandle, ColumnKind, ColumnResolver, ScanProjection, SynthesizedColumn};
pub use config::ScanConfig;
pub use expr::{col, lit, Expr};
pub use filter::{FilterCondition, PathElement, Subfield, SubfieldFilters};
pub use lazy::{LazyColumn, ScanBatch};
pub use metrics::ScanMetrics;
pub use scheduler::{SplitPoll, SplitScheduler, TaskHandle, TaskRegistry};
pub use split::{RowIdProperties, Split};
pub use table_scan::{ScanOutput, ScanState, TableScan, TableScanBuilder};
