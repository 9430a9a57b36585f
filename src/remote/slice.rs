//! Per-request views into a batched provider call.
//!
//! The driver creates one slice per batch member before any chunk arrives
//! and resolves the member's pending future with the consumer half. Data and
//! control share one FIFO: the queue's element type is a tagged
//! [`SliceItem`], and the caller-side iterator dispatches by tag.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::capacity::CapacityReservation;
use crate::chunk::{FinishReason, TokenChunk};
use crate::error::StreamError;
use crate::request::CompletionRequest;

/// One element on a slice's FIFO.
#[derive(Debug)]
pub enum SliceItem {
    /// A streamed token.
    Chunk(TokenChunk),
    /// Clean end-of-stream, with the finish reason the driver observed.
    Done(Option<FinishReason>),
    /// The underlying stream errored; the iterator should resume.
    Recovery(RecoveryAttempt),
    /// A definitive failure. Not retried.
    Failure(StreamError),
}

/// Placed on a slice's queue in lieu of a chunk when the driver errors or
/// times out. Never surfaces to the caller directly.
#[derive(Debug)]
pub struct RecoveryAttempt {
    /// The original request, for reissue.
    pub request: CompletionRequest,
    /// The underlying error.
    pub error: StreamError,
    /// Total retry budget for the stream.
    pub budget: u32,
}

/// Driver-side handle for one batch member.
pub(crate) struct SliceHandle {
    tx: mpsc::UnboundedSender<SliceItem>,
    request: CompletionRequest,
    request_id: u64,
    budget: u32,
    finish_reason: Option<FinishReason>,
    closed: bool,
    // released exactly once, when the slice terminates
    reservation: Option<CapacityReservation>,
}

impl SliceHandle {
    pub fn request(&self) -> &CompletionRequest {
        &self.request
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deliver a chunk. Dropped silently if the consumer went away.
    pub fn push(&self, chunk: TokenChunk) {
        let _ = self.tx.send(SliceItem::Chunk(chunk));
    }

    /// Record the finish reason without closing: upstream may keep sending
    /// chunks until end-of-stream.
    pub fn note_finish(&mut self, reason: Option<FinishReason>) {
        if reason.is_some() {
            self.finish_reason = reason;
        }
    }

    /// Terminate cleanly with the recorded finish reason.
    pub fn finish(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(SliceItem::Done(self.finish_reason));
        self.close();
    }

    /// Terminate with a recoverable error: the iterator will reissue.
    pub fn recover(&mut self, error: StreamError) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(SliceItem::Recovery(RecoveryAttempt {
            request: self.request.clone(),
            error,
            budget: self.budget,
        }));
        self.close();
    }

    /// Terminate with a definitive failure.
    pub fn fail(&mut self, error: StreamError) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(SliceItem::Failure(error));
        self.close();
    }

    fn close(&mut self) {
        self.closed = true;
        self.reservation.take();
    }
}

impl Drop for SliceHandle {
    fn drop(&mut self) {
        // a handle dropped mid-stream (driver task cancelled) must not leave
        // the consumer waiting with capacity still reserved
        if !self.closed {
            self.close();
        }
    }
}

/// Consumer half of one batch member, handed to the caller's iterator.
pub struct ResponseSlice {
    pub(crate) rx: mpsc::UnboundedReceiver<SliceItem>,
    pub(crate) request: CompletionRequest,
    pub(crate) request_id: u64,
    pub(crate) wait_timeout: Duration,
    pub(crate) budget: u32,
}

impl ResponseSlice {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

/// Create the driver/consumer halves for one batch member.
pub(crate) fn slice_pair(
    request: CompletionRequest,
    request_id: u64,
    wait_timeout: Duration,
    budget: u32,
    reservation: CapacityReservation,
) -> (SliceHandle, ResponseSlice) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SliceHandle {
        tx,
        request: request.clone(),
        request_id,
        budget,
        finish_reason: None,
        closed: false,
        reservation: Some(reservation),
    };
    let slice = ResponseSlice {
        rx,
        request,
        request_id,
        wait_timeout,
        budget,
    };
    (handle, slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityGauge;

    async fn test_pair(gauge: &std::sync::Arc<CapacityGauge>) -> (SliceHandle, ResponseSlice) {
        let reservation = gauge.acquire(1).await;
        slice_pair(
            CompletionRequest::new("text-davinci-003", "p"),
            7,
            Duration::from_secs(15),
            20,
            reservation,
        )
    }

    #[tokio::test]
    async fn test_chunks_delivered_in_order() {
        let gauge = CapacityGauge::new(10);
        let (handle, mut slice) = test_pair(&gauge).await;

        handle.push(TokenChunk::echoed("a", 0));
        handle.push(TokenChunk::echoed("b", 1));

        for expected in ["a", "b"] {
            match slice.rx.recv().await {
                Some(SliceItem::Chunk(c)) => assert_eq!(c.text, expected),
                other => panic!("expected chunk, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_finish_carries_recorded_reason_and_releases_capacity() {
        let gauge = CapacityGauge::new(10);
        let (mut handle, mut slice) = test_pair(&gauge).await;
        assert_eq!(gauge.reserved(), 1);

        handle.note_finish(Some(FinishReason::Length));
        handle.note_finish(None); // a later null annotation must not erase it
        handle.finish();
        assert_eq!(gauge.reserved(), 0);

        match slice.rx.recv().await {
            Some(SliceItem::Done(reason)) => assert_eq!(reason, Some(FinishReason::Length)),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recover_carries_request_and_budget() {
        let gauge = CapacityGauge::new(10);
        let (mut handle, mut slice) = test_pair(&gauge).await;

        handle.recover(StreamError::Stream("dropped".into()));
        match slice.rx.recv().await {
            Some(SliceItem::Recovery(attempt)) => {
                assert_eq!(attempt.budget, 20);
                assert_eq!(attempt.request.model, "text-davinci-003");
            }
            other => panic!("expected recovery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let gauge = CapacityGauge::new(10);
        let (mut handle, mut slice) = test_pair(&gauge).await;

        handle.finish();
        handle.fail(StreamError::Stream("late".into()));
        handle.recover(StreamError::Stream("later".into()));
        assert_eq!(gauge.reserved(), 0);

        assert!(matches!(slice.rx.recv().await, Some(SliceItem::Done(_))));
        // nothing after the terminator
        assert!(slice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_without_terminate_releases_capacity() {
        let gauge = CapacityGauge::new(10);
        let (handle, _slice) = test_pair(&gauge).await;
        assert_eq!(gauge.reserved(), 1);
        drop(handle);
        assert_eq!(gauge.reserved(), 0);
    }
}
