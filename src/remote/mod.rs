//! The batched streaming client for remote completion providers.
//!
//! ```text
//! complete() ──► RequestQueue ──► Batcher ──► driver ──► slices ──► TokenStream
//!                                   │                       ▲
//!                                   └── CallDescriptor ─────┘
//! ```
//!
//! Failures flow the other way: a dropped provider stream places a recovery
//! item on each open slice, and the caller-side [`TokenStream`] reissues the
//! request through the full scheduler with its consumed tokens replayed as
//! an extended prompt.

pub mod batcher;
pub mod buffer;
pub mod driver;
pub mod endpoint;
pub mod scheduler;
pub mod slice;
pub mod sse;
pub mod stream;

pub use buffer::{BufferView, ResponseBuffer};
pub use endpoint::ResolvedEndpoint;
pub use scheduler::{Scheduler, SchedulerConfig, StatsSnapshot};
pub use slice::{RecoveryAttempt, ResponseSlice, SliceItem};
pub use sse::SseDecoder;
pub use stream::TokenStream;
