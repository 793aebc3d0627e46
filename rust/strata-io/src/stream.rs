// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{Stream, TryStreamExt};
use pin_project::pin_project;

use strata_core::Result;

/// Output batches of one scan, with the schema they share
pub trait BatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Schema of every batch, known before the first one is read
    fn schema(&self) -> SchemaRef;

    /// Rows handed out so far
    fn rows_emitted(&self) -> u64;
}

/// Wraps a batch stream, counting the rows it yields
#[pin_project]
pub struct CountingBatchStream<S> {
    schema: SchemaRef,
    rows: u64,
    #[pin]
    inner: S,
}

impl<S> CountingBatchStream<S> {
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self {
            schema,
            rows: 0,
            inner,
        }
    }
}

impl<S> std::fmt::Debug for CountingBatchStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBatchStream")
            .field("rows", &self.rows)
            .finish()
    }
}

impl<S> BatchStream for CountingBatchStream<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn rows_emitted(&self) -> u64 {
        self.rows
    }
}

impl<S> Stream for CountingBatchStream<S>
where
    S: Stream<Item = Result<RecordBatch>>,
{
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(batch))) = &polled {
            *this.rows += batch.num_rows() as u64;
        }
        polled
    }
}

/// Drain a stream of batches, returning the batches and their total row count
pub async fn collect_batches<S>(stream: S) -> Result<(Vec<RecordBatch>, usize)>
where
    S: Stream<Item = Result<RecordBatch>>,
{
    let batches: Vec<RecordBatch> = stream.try_collect().await?;
    let num_rows = batches.iter().map(|b| b.num_rows()).sum();
    Ok((batches, num_rows))
}
