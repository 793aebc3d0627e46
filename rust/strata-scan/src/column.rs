// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Resolution of output columns to what has to be read (or synthesized) for them

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow_cast::can_cast_types;
use arrow_schema::{DataType, Schema, SchemaRef, TimeUnit};
use chrono::{NaiveDate, NaiveDateTime, TimeZone};
use datafusion_common::ScalarValue;
use snafu::location;
use strata_arrow::is_nested;
use strata_core::{
    Error, Result, BUCKET_COLUMN, FILE_MODIFIED_TIME_COLUMN, FILE_SIZE_COLUMN, PATH_COLUMN,
    ROW_ID_TYPE, ROW_INDEX_TYPE, SYNTHESIZED_PREFIX,
};

use crate::config::ScanConfig;

/// Columns derived from split metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthesizedColumn {
    Path,
    FileSize,
    FileModifiedTime,
    Bucket,
}

impl SynthesizedColumn {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            PATH_COLUMN => Some(Self::Path),
            FILE_SIZE_COLUMN => Some(Self::FileSize),
            FILE_MODIFIED_TIME_COLUMN => Some(Self::FileModifiedTime),
            BUCKET_COLUMN => Some(Self::Bucket),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Path => PATH_COLUMN,
            Self::FileSize => FILE_SIZE_COLUMN,
            Self::FileModifiedTime => FILE_MODIFIED_TIME_COLUMN,
            Self::Bucket => BUCKET_COLUMN,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Path => DataType::Utf8,
            Self::FileSize | Self::FileModifiedTime => DataType::Int64,
            Self::Bucket => DataType::Int32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Read from the file
    Regular,
    /// Constant per split, taken from the split's partition values
    PartitionKey,
    Synthesized(SynthesizedColumn),
    /// Ordinal of the row within its file
    RowIndex,
    /// File ordinal plus the split's row id properties
    RowId,
}

/// What an output column is made of
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnHandle {
    /// Name in the output schema
    pub name: String,
    /// Name in the file (or the partition key / synthesized column name)
    pub physical_name: String,
    /// Requested type
    pub data_type: DataType,
    pub kind: ColumnKind,
}

impl ColumnHandle {
    pub fn is_regular(&self) -> bool {
        self.kind == ColumnKind::Regular
    }

    /// Whether storage statistics can say anything about this column
    pub fn has_storage_stats(&self) -> bool {
        matches!(self.kind, ColumnKind::Regular | ColumnKind::PartitionKey)
    }
}

/// Output schema of a scan together with the handle of each column
///
/// Columns that filters need but the output does not (hidden columns) follow
/// the output columns.
#[derive(Debug, Clone)]
pub struct ScanProjection {
    schema: SchemaRef,
    columns: Vec<ColumnHandle>,
}

impl ScanProjection {
    /// The schema of the batches returned to the caller
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_output_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn columns(&self) -> &[ColumnHandle] {
        &self.columns
    }

    /// Find a column by output name or by physical name
    pub fn lookup(&self, name: &str) -> Option<(usize, &ColumnHandle)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .enumerate()
                    .find(|(_, c)| c.physical_name == name)
            })
    }

    pub fn physical_columns(&self) -> impl Iterator<Item = (usize, &ColumnHandle)> {
        self.columns.iter().enumerate().filter(|(_, c)| c.is_regular())
    }
}

/// Builds [`ColumnHandle`]s for an output schema
#[derive(Debug, Clone, Default)]
pub struct ColumnResolver {
    aliases: HashMap<String, String>,
    partition_keys: HashSet<String>,
    row_index_columns: HashSet<String>,
    row_id_columns: HashSet<String>,
    case_insensitive: bool,
}

impl ColumnResolver {
    /// Read output column `name` from the file column `physical_name`
    pub fn with_alias(mut self, name: impl Into<String>, physical_name: impl Into<String>) -> Self {
        self.aliases.insert(name.into(), physical_name.into());
        self
    }

    pub fn with_partition_key(mut self, name: impl Into<String>) -> Self {
        self.partition_keys.insert(name.into());
        self
    }

    pub fn with_row_index(mut self, name: impl Into<String>) -> Self {
        self.row_index_columns.insert(name.into());
        self
    }

    pub fn with_row_id(mut self, name: impl Into<String>) -> Self {
        self.row_id_columns.insert(name.into());
        self
    }

    pub fn with_case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive = case_insensitive;
        self
    }

    fn normalize(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    fn resolve_one(&self, name: &str, data_type: &DataType) -> Result<ColumnHandle> {
        let physical_name = self
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        let handle = |kind| ColumnHandle {
            name: name.to_string(),
            physical_name: physical_name.clone(),
            data_type: data_type.clone(),
            kind,
        };

        if self.row_index_columns.contains(name) {
            if data_type != &ROW_INDEX_TYPE {
                return Err(Error::invalid_input(
                    format!("Row index column {} must be {}", name, ROW_INDEX_TYPE),
                    location!(),
                ));
            }
            return Ok(handle(ColumnKind::RowIndex));
        }
        if self.row_id_columns.contains(name) {
            if data_type != &*ROW_ID_TYPE {
                return Err(Error::invalid_input(
                    format!("Row id column {} must be {}", name, *ROW_ID_TYPE),
                    location!(),
                ));
            }
            return Ok(handle(ColumnKind::RowId));
        }
        if physical_name.starts_with(SYNTHESIZED_PREFIX) {
            let synthesized = SynthesizedColumn::from_name(&physical_name).ok_or_else(|| {
                Error::invalid_input(
                    format!("Unknown synthesized column {}", physical_name),
                    location!(),
                )
            })?;
            if !can_cast_types(&synthesized.data_type(), data_type) {
                return Err(Error::SchemaMismatch {
                    message: format!(
                        "{} is {} and cannot be read as {}",
                        physical_name,
                        synthesized.data_type(),
                        data_type
                    ),
                    location: location!(),
                });
            }
            return Ok(handle(ColumnKind::Synthesized(synthesized)));
        }
        if self.partition_keys.contains(&physical_name) {
            return Ok(handle(ColumnKind::PartitionKey));
        }
        Ok(ColumnHandle {
            physical_name: self.normalize(&physical_name),
            ..handle(ColumnKind::Regular)
        })
    }

    /// Resolve every column of `output_schema`
    pub fn resolve(&self, output_schema: &Schema) -> Result<ScanProjection> {
        self.resolve_with_hidden(output_schema, &Schema::empty())
    }

    /// Resolve the output columns plus columns that are only read for filtering
    pub fn resolve_with_hidden(
        &self,
        output_schema: &Schema,
        hidden: &Schema,
    ) -> Result<ScanProjection> {
        let mut columns = Vec::with_capacity(output_schema.fields().len() + hidden.fields().len());
        let mut seen_physical = HashMap::new();
        for field in output_schema.fields().iter().chain(hidden.fields().iter()) {
            let handle = self.resolve_one(field.name(), field.data_type())?;
            if matches!(handle.kind, ColumnKind::Regular | ColumnKind::PartitionKey) {
                if let Some(previous) =
                    seen_physical.insert(handle.physical_name.clone(), handle.name.clone())
                {
                    return Err(Error::invalid_input(
                        format!(
                            "Output columns {} and {} both read {}",
                            previous, handle.name, handle.physical_name
                        ),
                        location!(),
                    ));
                }
            }
            columns.push(handle);
        }
        Ok(ScanProjection {
            schema: Arc::new(output_schema.clone()),
            columns,
        })
    }
}

/// Check that a column stored as `file_type` can be returned as `requested`
pub fn check_compatible(column: &str, file_type: &DataType, requested: &DataType) -> Result<()> {
    if file_type == requested {
        return Ok(());
    }
    if is_nested(file_type) != is_nested(requested) || !can_cast_types(file_type, requested) {
        return Err(Error::SchemaMismatch {
            message: format!(
                "column {} is stored as {} which is incompatible with the requested type {}",
                column, file_type, requested
            ),
            location: location!(),
        });
    }
    Ok(())
}

const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";
const PARTITION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a partition value into a scalar of `data_type`. `None` is null.
pub fn parse_partition_value(
    value: Option<&str>,
    data_type: &DataType,
    config: &ScanConfig,
) -> Result<ScalarValue> {
    let invalid = |message: String| Error::invalid_input(message, location!());
    let Some(value) = value else {
        return ScalarValue::try_from(data_type)
            .map_err(|e| invalid(format!("Unsupported partition key type {}: {}", data_type, e)));
    };

    match data_type {
        DataType::Date32 => {
            let date = NaiveDate::parse_from_str(value, PARTITION_DATE_FORMAT)
                .map_err(|e| invalid(format!("Invalid date partition value {:?}: {}", value, e)))?;
            let days = date.signed_duration_since(NaiveDate::default()).num_days();
            Ok(ScalarValue::Date32(Some(days as i32)))
        }
        DataType::Timestamp(unit, tz) => {
            let naive = NaiveDateTime::parse_from_str(value, PARTITION_TIMESTAMP_FORMAT)
                .map_err(|e| {
                    invalid(format!("Invalid timestamp partition value {:?}: {}", value, e))
                })?;
            let utc = if config.partition_timestamps_as_local {
                config
                    .session_time_zone
                    .from_local_datetime(&naive)
                    .single()
                    .ok_or_else(|| {
                        invalid(format!("Ambiguous local timestamp partition value {:?}", value))
                    })?
                    .naive_utc()
            } else {
                naive
            }
            .and_utc();
            let tz = tz.clone();
            Ok(match unit {
                TimeUnit::Second => ScalarValue::TimestampSecond(Some(utc.timestamp()), tz),
                TimeUnit::Millisecond => {
                    ScalarValue::TimestampMillisecond(Some(utc.timestamp_millis()), tz)
                }
                TimeUnit::Microsecond => {
                    ScalarValue::TimestampMicrosecond(Some(utc.timestamp_micros()), tz)
                }
                TimeUnit::Nanosecond => {
                    let nanos = utc.timestamp_nanos_opt().ok_or_else(|| {
                        invalid(format!("Timestamp partition value {:?} out of range", value))
                    })?;
                    ScalarValue::TimestampNanosecond(Some(nanos), tz)
                }
            })
        }
        _ => ScalarValue::Utf8(Some(value.to_string()))
            .cast_to(data_type)
            .map_err(|e| {
                invalid(format!(
                    "Partition value {:?} is not a valid {}: {}",
                    value, data_type, e
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{Field, Fields};
    use chrono::FixedOffset;
    use strata_core::ErrorKind;

    use super::*;

    fn schema(fields: Vec<(&str, DataType)>) -> Schema {
        Schema::new(
            fields
                .into_iter()
                .map(|(name, data_type)| Field::new(name, data_type, true))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_resolve_kinds() {
        let resolver = ColumnResolver::default()
            .with_alias("total", "c1")
            .with_partition_key("ds")
            .with_row_index("row_idx");
        let projection = resolver
            .resolve(&schema(vec![
                ("c0", DataType::Int64),
                ("total", DataType::Float64),
                ("ds", DataType::Utf8),
                ("$path", DataType::Utf8),
                ("row_idx", DataType::Int64),
            ]))
            .unwrap();

        let kinds: Vec<ColumnKind> = projection.columns().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ColumnKind::Regular,
                ColumnKind::Regular,
                ColumnKind::PartitionKey,
                ColumnKind::Synthesized(SynthesizedColumn::Path),
                ColumnKind::RowIndex,
            ]
        );
        assert_eq!(projection.columns()[1].physical_name, "c1");
        assert_eq!(projection.lookup("c1").unwrap().0, 1);
        assert_eq!(projection.lookup("total").unwrap().0, 1);
        assert_eq!(projection.physical_columns().count(), 2);
        assert_eq!(projection.num_output_columns(), 5);
    }

    #[test]
    fn test_hidden_columns() {
        let projection = ColumnResolver::default()
            .resolve_with_hidden(
                &schema(vec![("c1", DataType::Int64)]),
                &schema(vec![("c0", DataType::Int64)]),
            )
            .unwrap();
        assert_eq!(projection.num_output_columns(), 1);
        assert_eq!(projection.columns().len(), 2);
        assert_eq!(projection.lookup("c0").unwrap().0, 1);
        assert_eq!(projection.schema().fields().len(), 1);
    }

    #[test]
    fn test_resolve_errors() {
        let err = ColumnResolver::default()
            .with_alias("a", "c0")
            .resolve(&schema(vec![("a", DataType::Int64), ("c0", DataType::Int64)]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.to_string().contains("both read c0"));

        let err = ColumnResolver::default()
            .resolve(&schema(vec![("$nope", DataType::Utf8)]))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown synthesized column"));

        let row_id = ColumnResolver::default()
            .with_row_id("rid")
            .resolve(&schema(vec![("rid", DataType::Int64)]));
        assert!(row_id.is_err());
    }

    #[test]
    fn test_case_insensitive_physical_names() {
        let projection = ColumnResolver::default()
            .with_case_insensitive(true)
            .resolve(&schema(vec![("Alpha", DataType::Int32)]))
            .unwrap();
        assert_eq!(projection.columns()[0].physical_name, "alpha");
        assert_eq!(projection.columns()[0].name, "Alpha");
    }

    #[test]
    fn test_check_compatible() {
        check_compatible("c", &DataType::Int32, &DataType::Int64).unwrap();
        let map = DataType::Map(
            Arc::new(Field::new(
                "entries",
                DataType::Struct(Fields::from(vec![
                    Field::new("key", DataType::Utf8, false),
                    Field::new("value", DataType::Int64, true),
                ])),
                false,
            )),
            false,
        );
        let err = check_compatible("c", &map, &DataType::Int64).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn test_parse_partition_values() {
        let config = ScanConfig::default();
        assert_eq!(
            parse_partition_value(Some("42"), &DataType::Int32, &config).unwrap(),
            ScalarValue::Int32(Some(42))
        );
        assert_eq!(
            parse_partition_value(None, &DataType::Int32, &config).unwrap(),
            ScalarValue::Int32(None)
        );
        assert_eq!(
            parse_partition_value(Some("1970-01-03"), &DataType::Date32, &config).unwrap(),
            ScalarValue::Date32(Some(2))
        );
        assert!(parse_partition_value(Some("abc"), &DataType::Int32, &config).is_err());

        let ts = DataType::Timestamp(TimeUnit::Second, None);
        assert_eq!(
            parse_partition_value(Some("1970-01-01 01:00:00"), &ts, &config).unwrap(),
            ScalarValue::TimestampSecond(Some(3600), None)
        );

        // Two hours east of UTC: local 01:00 is 23:00 of the previous day in UTC
        let local = ScanConfig::default()
            .with_partition_timestamps_as_local(FixedOffset::east_opt(2 * 3600).unwrap());
        assert_eq!(
            parse_partition_value(Some("1970-01-01 01:00:00"), &ts, &local).unwrap(),
            ScalarValue::TimestampSecond(Some(-3600), None)
        );
    }
}
