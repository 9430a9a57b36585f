//! # tokenflow
//!
//! The token-streaming core of a query-driven language-model runtime: a
//! **batched completion scheduler** for remote streamed APIs and **LMTP**, a
//! token-streaming protocol for locally hosted models. Both expose the same
//! caller contract: an async iterator of per-token records per request.
//!
//! ## Remote backends
//!
//! [`Scheduler::complete`] enqueues a request; compatible requests are fused
//! into one provider call, the SSE response is demultiplexed into
//! per-request slices, and the returned [`TokenStream`] recovers
//! transparently from mid-stream drops by replaying consumed tokens as an
//! extended prompt. A process-wide [`CapacityGauge`] bounds in-flight work.
//!
//! ```no_run
//! use tokenflow::{CompletionRequest, Scheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = Scheduler::new(SchedulerConfig::default());
//!     let request = CompletionRequest::new("text-davinci-003", "Say this is a test")
//!         .with_max_tokens(8)
//!         .with_logprobs(5);
//!     let mut stream = scheduler.complete(request).await?;
//!     while let Some(chunk) = stream.next().await {
//!         print!("{}", chunk?.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Local backends
//!
//! An [`lmtp::LmtpClient`] multiplexes `GENERATE` and `SCORE` streams over
//! one framed transport to a [`lmtp::TokenSession`], which drives a
//! [`lmtp::LocalModel`] with per-step logit-bias enforcement. Transports:
//! in-process duplex, subprocess pipe, websocket.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenflow::lmtp::{duplex_pair, serve_transport, GenerateOptions, LmtpClient, MockModel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client_side, server_side) = duplex_pair();
//!     serve_transport(Arc::new(MockModel::new(16, 7)), server_side);
//!
//!     let client = LmtpClient::new(client_side, "mock");
//!     let mut stream = client.generate(vec![1, 2, 3], GenerateOptions::default())?;
//!     while let Some(token) = stream.next().await {
//!         print!("{}", token?.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod capacity;
pub mod chat;
pub mod chunk;
pub mod error;
pub mod lmtp;
pub mod remote;
pub mod request;
pub mod tokenizer;
pub mod trace;

pub use capacity::{CapacityGauge, CapacityReservation};
pub use chat::{tagged_segments, Role, Segment};
pub use chunk::{FinishReason, TokenChunk, ENDOFTEXT};
pub use error::{Result, StreamError};
pub use remote::{
    ResponseBuffer, ResponseSlice, Scheduler, SchedulerConfig, SseDecoder, StatsSnapshot,
    TokenStream,
};
pub use request::{ApiConfig, CompletionRequest, ErrorPolicy, Prompt, ProviderHints};
pub use tokenizer::{AsciiTokenizer, Tokenizer};
pub use trace::{FnTraceSink, TraceEvent, TraceSink};
