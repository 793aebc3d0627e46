// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::{collections::HashSet, ptr::NonNull};

use arrow_array::Array;
use arrow_data::ArrayData;

/// Counts memory used by buffers of Arrow arrays.
///
/// This is meant to estimate how many bytes a batch costs once materialized.
///
/// * Buffers shared by several arrays (e.g. a dictionary base referenced by many
///   constant or dictionary vectors) are only counted once.
/// * The **total** size of each buffer is counted, even if the array is a slice.
#[derive(Default)]
pub struct MemoryAccumulator {
    seen: HashSet<NonNull<u8>>,
    total: usize,
}

impl MemoryAccumulator {
    pub fn record_array(&mut self, array: &dyn Array) {
        let data = array.to_data();
        self.record_array_data(&data);
    }

    fn record_array_data(&mut self, data: &ArrayData) {
        for buffer in data.buffers() {
            let ptr = buffer.data_ptr();
            if self.seen.insert(ptr) {
                self.total += buffer.capacity();
            }
        }

        if let Some(nulls) = data.nulls() {
            let null_buf = nulls.inner().inner();
            let ptr = null_buf.data_ptr();
            if self.seen.insert(ptr) {
                self.total += null_buf.capacity();
            }
        }

        for child in data.child_data() {
            self.record_array_data(child);
        }
    }

    /// Adds bytes that are not backed by an arrow buffer (e.g. an estimate for
    /// a column that has not been materialized yet)
    pub fn record_estimate(&mut self, bytes: usize) {
        self.total += bytes;
    }

    pub fn total(&self) -> usize {
        self.total
    }

}
