//! The per-request stream iterator handed to callers.
//!
//! [`TokenStream`] pulls tagged items off its slice's FIFO and yields
//! [`TokenChunk`]s. When the underlying provider stream drops, the iterator
//! recovers transparently: it reissues the original prompt extended with
//! everything already consumed, skips the replayed prefix on the fresh
//! stream, and adopts it as its new source. Callers only ever see tokens or
//! a final error.

use std::collections::VecDeque;
use std::sync::Weak;

use crate::chunk::{FinishReason, TokenChunk};
use crate::error::{Result, StreamError};
use crate::remote::scheduler::SchedulerInner;
use crate::remote::slice::{RecoveryAttempt, ResponseSlice, SliceItem};
use crate::request::{CompletionRequest, Prompt};
use crate::tokenizer::Tokenizer;

/// Async sequence of [`TokenChunk`]s for one request.
pub struct TokenStream {
    slice: ResponseSlice,
    scheduler: Weak<SchedulerInner>,
    /// Items handed back by the replay logic for the main loop to process.
    pending: VecDeque<SliceItem>,
    retries: u32,
    text: String,
    consumed_tokens: Vec<String>,
    delivered: u64,
    done: bool,
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("retries", &self.retries)
            .field("delivered", &self.delivered)
            .field("done", &self.done)
            .finish()
    }
}

enum Pulled {
    Item(SliceItem),
    Stalled,
    Closed,
}

enum Replay {
    /// The fresh stream is aligned with the consumed prefix; an overshoot
    /// partial chunk may need to be yielded first.
    Aligned(Option<TokenChunk>),
    /// The replay failed recoverably; try again.
    Retry(StreamError),
    /// The replay failed definitively.
    Fatal(StreamError),
    /// The scheduler went away.
    Closed,
}

impl TokenStream {
    pub(crate) fn new(slice: ResponseSlice, scheduler: Weak<SchedulerInner>) -> TokenStream {
        TokenStream {
            slice,
            scheduler,
            pending: VecDeque::new(),
            retries: 0,
            text: String::new(),
            consumed_tokens: Vec::new(),
            delivered: 0,
            done: false,
        }
    }

    /// Concatenation of all yielded chunk text, echo prefix included.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// String representations of every consumed token, in order.
    pub fn consumed_tokens(&self) -> &[String] {
        &self.consumed_tokens
    }

    /// How many recovery attempts this stream has made.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn request_id(&self) -> u64 {
        self.slice.request_id
    }

    /// Yield the next chunk, `None` at end-of-stream, or a final error.
    pub async fn next(&mut self) -> Option<Result<TokenChunk>> {
        if self.done {
            return None;
        }
        loop {
            let item = match self.pull().await {
                Pulled::Item(item) => item,
                Pulled::Closed => {
                    // driver went away without a terminator: shutdown
                    self.done = true;
                    return None;
                }
                Pulled::Stalled => SliceItem::Recovery(RecoveryAttempt {
                    request: self.slice.request.clone(),
                    error: StreamError::Timeout("token stream stalled".into()),
                    budget: self.slice.budget,
                }),
            };

            match item {
                SliceItem::Chunk(chunk) => {
                    self.delivered += 1;
                    self.text.push_str(&chunk.text);
                    self.consumed_tokens.push(chunk.token.clone());
                    return Some(Ok(chunk));
                }
                SliceItem::Done(reason) => {
                    self.done = true;
                    if reason == Some(FinishReason::Length) {
                        return None;
                    }
                    if self.delivered == 0 {
                        // nothing was generated; end quietly
                        return None;
                    }
                    let chunk = TokenChunk::endoftext();
                    self.text.push_str(&chunk.text);
                    self.consumed_tokens.push(chunk.token.clone());
                    return Some(Ok(chunk));
                }
                SliceItem::Failure(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
                SliceItem::Recovery(attempt) => {
                    match self.begin_recovery(attempt).await {
                        Ok(Some(partial)) => {
                            self.delivered += 1;
                            return Some(Ok(partial));
                        }
                        Ok(None) => {
                            if self.done {
                                return None;
                            }
                            // aligned; keep pulling from the adopted slice
                        }
                        Err(error) => {
                            self.done = true;
                            return Some(Err(error));
                        }
                    }
                }
            }
        }
    }

    /// Drain the stream and return the full text.
    pub async fn collect_text(&mut self) -> Result<String> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.text.clone())
    }

    async fn pull(&mut self) -> Pulled {
        if let Some(item) = self.pending.pop_front() {
            return Pulled::Item(item);
        }
        match tokio::time::timeout(self.slice.wait_timeout, self.slice.rx.recv()).await {
            Ok(Some(item)) => Pulled::Item(item),
            Ok(None) => Pulled::Closed,
            Err(_) => Pulled::Stalled,
        }
    }

    /// Reissue the request with the consumed prefix appended and re-align a
    /// fresh slice. Loops over nested failures until the budget runs out.
    async fn begin_recovery(
        &mut self,
        attempt: RecoveryAttempt,
    ) -> Result<Option<TokenChunk>> {
        let budget = attempt.budget;
        let mut error = attempt.error;
        loop {
            self.retries += 1;
            if self.retries > budget {
                return Err(StreamError::MaximumRetriesExceeded {
                    retries: self.retries,
                    cause: Box::new(error),
                });
            }
            let Some(scheduler) = self.scheduler.upgrade() else {
                // the scheduler is gone; results would be discarded anyway
                self.done = true;
                return Ok(None);
            };
            let Some(tokenizer) = scheduler.tokenizer_for(&self.slice.request) else {
                tracing::warn!(
                    request_id = self.slice.request_id,
                    "cannot recover from a stream error without a configured tokenizer"
                );
                return Err(error);
            };
            tracing::warn!(
                request_id = self.slice.request_id,
                retries = self.retries,
                %error,
                "token stream dropped, resuming with replayed prompt"
            );

            let request = self.recovery_request(tokenizer.as_ref());
            let fresh = match scheduler.resubmit(request, self.slice.request_id).await {
                Ok(slice) => slice,
                Err(StreamError::Shutdown) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) if e.is_definitive() => return Err(e),
                Err(e) => {
                    error = e;
                    continue;
                }
            };

            match self.replay(fresh).await {
                Replay::Aligned(overshoot) => return Ok(overshoot),
                Replay::Retry(e) => {
                    error = e;
                    continue;
                }
                Replay::Fatal(e) => return Err(e),
                Replay::Closed => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }

    /// The reissued request: the original prompt extended with everything
    /// consumed so far (echo included, so the consumed text is the whole
    /// new prompt).
    fn recovery_request(&self, tokenizer: &dyn Tokenizer) -> CompletionRequest {
        let mut request = self.slice.request.clone();
        if !self.text.is_empty() {
            request.prompt = match &request.prompt {
                Prompt::Text(_) => Prompt::Text(self.text.clone()),
                Prompt::Ids(_) => Prompt::Ids(tokenizer.encode(&self.text)),
            };
        }
        request
    }

    /// Advance a fresh slice until its text matches the consumed prefix.
    /// On a mid-chunk overshoot (upstream re-segmented the boundary), the
    /// partial chunk covering only the overshoot is returned for yielding.
    async fn replay(&mut self, mut fresh: ResponseSlice) -> Replay {
        let target = self.text.len();
        if target == 0 {
            self.slice = fresh;
            return Replay::Aligned(None);
        }

        let mut text = String::new();
        let mut tokens: Vec<String> = Vec::new();
        loop {
            let item = match tokio::time::timeout(fresh.wait_timeout, fresh.rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => return Replay::Closed,
                Err(_) => {
                    return Replay::Retry(StreamError::Timeout("replayed stream stalled".into()))
                }
            };
            match item {
                SliceItem::Chunk(chunk) => {
                    text.push_str(&chunk.text);
                    tokens.push(chunk.token.clone());
                    if text.len() >= target {
                        let overshoot = if text.len() > target {
                            let mut partial = chunk;
                            partial.text = text[target..].to_string();
                            partial.text_offset = target;
                            partial.fixed = false;
                            Some(partial)
                        } else {
                            None
                        };
                        // adopt the fresh stream; the consumed token list
                        // never shrinks, even if the replay re-segmented
                        if tokens.len() > self.consumed_tokens.len() {
                            self.consumed_tokens = tokens;
                        }
                        self.text = text;
                        self.slice = fresh;
                        return Replay::Aligned(overshoot);
                    }
                }
                SliceItem::Done(reason) => {
                    // the replayed stream ended at or before the alignment
                    // point; let the main loop apply the terminal rules
                    self.slice = fresh;
                    self.pending.push_back(SliceItem::Done(reason));
                    return Replay::Aligned(None);
                }
                SliceItem::Recovery(attempt) => return Replay::Retry(attempt.error),
                SliceItem::Failure(error) => return Replay::Fatal(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityGauge;
    use crate::remote::slice::{slice_pair, SliceHandle};
    use std::time::Duration;

    async fn stream_pair(wait_timeout: Duration) -> (SliceHandle, TokenStream) {
        let gauge = CapacityGauge::new(100);
        let reservation = gauge.acquire(1).await;
        let (handle, slice) = slice_pair(
            CompletionRequest::new("text-davinci-003", "P"),
            0,
            wait_timeout,
            20,
            reservation,
        );
        (handle, TokenStream::new(slice, Weak::new()))
    }

    fn chunk(text: &str) -> TokenChunk {
        let mut c = TokenChunk::echoed(text, 0);
        c.fixed = false;
        c
    }

    #[tokio::test]
    async fn test_chunks_then_eos_synthesis() {
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.push(chunk("a"));
        handle.push(chunk("b"));
        handle.finish();

        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().text, "b");
        // finish reason was null: an end-of-text chunk is synthesized
        let eos = stream.next().await.unwrap().unwrap();
        assert_eq!(eos.text, "<|endoftext|>");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.text(), "ab<|endoftext|>");
        assert_eq!(stream.consumed_tokens().len(), 3);
    }

    #[tokio::test]
    async fn test_length_finish_closes_without_synthesis() {
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.push(chunk("a"));
        handle.note_finish(Some(FinishReason::Length));
        handle.finish();

        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.text(), "a");
    }

    #[tokio::test]
    async fn test_empty_stream_ends_quietly() {
        // zero chunks delivered and a clean terminator: no synthesis
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.finish();
        assert!(stream.next().await.is_none());
        assert!(stream.text().is_empty());
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.push(chunk("a"));
        handle.fail(StreamError::Configuration("bad key".into()));

        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Configuration(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_is_end_of_iteration() {
        let (handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        drop(handle);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_recovery_without_scheduler_exhausts_budget() {
        // with a dead scheduler the recovery path ends the stream quietly
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.push(chunk("a"));
        handle.recover(StreamError::Stream("dropped".into()));

        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stall_without_scheduler_ends_stream() {
        let (_handle, mut stream) = stream_pair(Duration::from_millis(20)).await;
        // nothing arrives: the stall becomes a recovery attempt, which ends
        // quietly because no scheduler is reachable
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_consumed_tokens_monotonic() {
        let (mut handle, mut stream) = stream_pair(Duration::from_secs(5)).await;
        handle.push(chunk("a"));
        handle.push(chunk("b"));
        handle.finish();

        let mut last = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            assert!(stream.consumed_tokens().len() >= last);
            last = stream.consumed_tokens().len();
        }
    }
}
