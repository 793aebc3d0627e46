// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project::pin_project;
use tracing::Span;

/// A stream that enters `span` every time it is polled.
#[pin_project]
pub struct InstrumentedStream<I: Stream> {
    #[pin]
    stream: I,
    span: Span,
}

impl<I: Stream> Stream for InstrumentedStream<I> {
    type Item = I::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.span.enter();
        this.stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

// `in_current_span` is already taken by tracing's Instrument trait for all Sized types
pub trait StreamTracingExt: Stream + Sized {
    /// All polls of the stream happen in the span that is current when this is called.
    ///
    /// Scans are usually driven from a different task than the one that built
    /// them, so without this the scan's log and trace events lose their parent.
    fn stream_in_current_span(self) -> InstrumentedStream<Self> {
        self.stream_in_span(Span::current())
    }

    /// All polls of the stream happen in `span`
    fn stream_in_span(self, span: Span) -> InstrumentedStream<Self> {
        InstrumentedStream { stream: self, span }
    }
}

impl<S: Stream> StreamTracingExt for S {}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_instrumented_stream_passes_items_through() {
        let span = tracing::info_span!("scan");
        let items: Vec<i32> = futures::stream::iter(vec![1, 2, 3])
            .stream_in_span(span)
            .collect()
            .await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}
