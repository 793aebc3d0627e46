// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use arrow_schema::{DataType, Field as ArrowField, Fields};
use std::sync::LazyLock;

pub mod cache;
pub mod error;
pub mod utils;

pub use error::{ArrowResult, Error, ErrorKind, Result};

/// Column name for the path of the file a row was read from.
pub const PATH_COLUMN: &str = "$path";
/// Column name for the size in bytes of the file a row was read from.
pub const FILE_SIZE_COLUMN: &str = "$file_size";
/// Column name for the last modification time (ms since epoch) of the file.
pub const FILE_MODIFIED_TIME_COLUMN: &str = "$file_modified_time";
/// Column name for the bucket number of the split.
pub const BUCKET_COLUMN: &str = "$bucket";

/// Prefix reserved for synthesized columns.
pub const SYNTHESIZED_PREFIX: char = '$';

pub const ROW_NUMBER_FIELD_NAME: &str = "row_number";
pub const METADATA_VERSION_FIELD_NAME: &str = "metadata_version";
pub const PARTITION_ID_FIELD_NAME: &str = "partition_id";
pub const TABLE_GUID_FIELD_NAME: &str = "table_guid";

/// Row index type: the ordinal of a row within its file.
pub static ROW_INDEX_TYPE: DataType = DataType::Int64;

/// Children of a row id column.
pub static ROW_ID_FIELDS: LazyLock<Fields> = LazyLock::new(|| {
    Fields::from(vec![
        ArrowField::new(ROW_NUMBER_FIELD_NAME, DataType::Int64, false),
        ArrowField::new(METADATA_VERSION_FIELD_NAME, DataType::Int64, true),
        ArrowField::new(PARTITION_ID_FIELD_NAME, DataType::Int64, true),
        ArrowField::new(TABLE_GUID_FIELD_NAME, DataType::Utf8, true),
    ])
});

/// Row id type. A struct so that callers can tell rows apart across files and tables.
pub static ROW_ID_TYPE: LazyLock<DataType> =
    LazyLock::new(|| DataType::Struct(ROW_ID_FIELDS.clone()));
