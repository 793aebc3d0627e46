// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Arrow helpers shared by the Strata crates.

pub mod memory;
pub mod schema;

pub use memory::MemoryAccumulator;
pub use schema::{is_nested, Indentation, SchemaExt};
