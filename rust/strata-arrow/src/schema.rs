// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Extension to arrow schema

use arrow_schema::{DataType, Field, FieldRef, Schema};

pub enum Indentation {
    OneLine,
    MultiLine(u8),
}

impl Indentation {
    fn value(&self) -> String {
        match self {
            Self::OneLine => "".to_string(),
            Self::MultiLine(spaces) => " ".repeat(*spaces as usize),
        }
    }

    fn deepen(&self) -> Self {
        match self {
            Self::OneLine => Self::OneLine,
            Self::MultiLine(spaces) => Self::MultiLine(spaces + 2),
        }
    }
}

/// Returns true if values of this type have child values (struct, list, map, ...)
pub fn is_nested(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Struct(_)
            | DataType::List(_)
            | DataType::LargeList(_)
            | DataType::FixedSizeList(_, _)
            | DataType::ListView(_)
            | DataType::LargeListView(_)
            | DataType::Map(_, _)
            | DataType::Union(_, _)
    )
}

fn compact_field_string(field: &Field, indent: Indentation) -> String {
    let mut result = format!("{}: ", field.name());
    result.push_str(&compact_type_string(field.data_type(), &indent));
    if field.is_nullable() {
        result.push('?');
    }
    result
}

fn compact_type_string(data_type: &DataType, indent: &Indentation) -> String {
    let mut result = String::new();
    match data_type {
        DataType::Struct(fields) => {
            result.push('{');
            result.push_str(&indent.value());
            for (field_idx, field) in fields.iter().enumerate() {
                result.push_str(&compact_field_string(field, indent.deepen()));
                if field_idx < fields.len() - 1 {
                    result.push(',');
                }
                result.push_str(&indent.value());
            }
            result.push('}');
        }
        DataType::List(field) | DataType::LargeList(field) => {
            result.push('[');
            result.push_str(&compact_field_string(field, indent.deepen()));
            result.push(']');
        }
        DataType::Map(entries, _) => {
            result.push_str("map<");
            result.push_str(&compact_field_string(entries, indent.deepen()));
            result.push('>');
        }
        DataType::Dictionary(key_type, value_type) => {
            result.push_str(&value_type.to_string());
            result.push('@');
            result.push_str(&key_type.to_string());
        }
        _ => result.push_str(&data_type.to_string()),
    }
    result
}

/// Extends the functionality of [arrow_schema::Schema].
pub trait SchemaExt {
    /// Find a top-level field by name.
    ///
    /// When `case_insensitive` is set both sides are compared in lower case.
    fn field_by_name(&self, name: &str, case_insensitive: bool) -> Option<(usize, &FieldRef)>;

    /// Create a compact string representation of the schema
    fn to_compact_string(&self, indent: Indentation) -> String;
}

impl SchemaExt for Schema {
    fn field_by_name(&self, name: &str, case_insensitive: bool) -> Option<(usize, &FieldRef)> {
        if !case_insensitive {
            return self.fields().find(name);
        }
        let lowered = name.to_lowercase();
        self.fields()
            .iter()
            .enumerate()
            .find(|(_, f)| f.name().to_lowercase() == lowered)
    }

    fn to_compact_string(&self, indent: Indentation) -> String {
        let mut result = "{".to_string();
        result.push_str(&indent.value());
        for (field_idx, field) in self.fields.iter().enumerate() {
            result.push_str(&compact_field_string(field, indent.deepen()));
            if field_idx < self.fields.len() - 1 {
                result.push(',');
            }
            result.push_str(&indent.value());
        }
        result.push('}');
        result
    }
}
