//! The batched completion scheduler.
//!
//! A [`Scheduler`] owns everything that used to be process-global state:
//! the capacity gauge, request statistics, the pending-request queue, and
//! the one-time warning flags. `complete()` enqueues a request and resolves
//! to a [`TokenStream`] once the driver has opened a provider call for it.
//!
//! One batcher task groups compatible requests; a fixed pool of driver
//! workers (default 5) executes the resulting call descriptors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::capacity::CapacityGauge;
use crate::error::{Result, StreamError};
use crate::remote::batcher::{Batcher, CallDescriptor, QueueItem, RequestQueue};
use crate::remote::driver;
use crate::remote::slice::ResponseSlice;
use crate::remote::stream::TokenStream;
use crate::request::{CompletionRequest, DEFAULT_EOS_TOKEN_ID};
use crate::tokenizer::Tokenizer;

/// How long the batcher sleeps while the capacity gauge is throttling.
const THROTTLE_POLL: Duration = Duration::from_millis(100);

/// Scheduler tuning knobs.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Maximum requests fused into one provider call.
    pub batch_size: usize,
    /// How long the batcher waits for stragglers after the first item.
    pub maximum_collection_period: Duration,
    /// Retry budget shared by the descriptor-level call and per-stream
    /// recovery.
    pub maximum_retries: u32,
    /// Number of concurrent driver worker tasks.
    pub workers: usize,
    /// Total token-slot capacity.
    pub capacity: u64,
    /// Default per-chunk stall timeout for the driver.
    pub stall_timeout: Duration,
    /// Default wait timeout for the caller-side iterator.
    pub stream_timeout: Duration,
    /// Connect timeout for opening a provider call.
    pub connect_timeout: Duration,
    /// Tokenizer used for chat synthesis and recovery when a request does
    /// not bring its own.
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    /// Probability of injecting a fault per parsed record. Testing only.
    pub chaos: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            batch_size: 20,
            maximum_collection_period: Duration::from_millis(50),
            maximum_retries: 20,
            workers: 5,
            capacity: 32_000,
            stall_timeout: Duration::from_millis(1500),
            stream_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_millis(5500),
            tokenizer: None,
            chaos: None,
        }
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("batch_size", &self.batch_size)
            .field("maximum_collection_period", &self.maximum_collection_period)
            .field("maximum_retries", &self.maximum_retries)
            .field("workers", &self.workers)
            .field("capacity", &self.capacity)
            .field("stall_timeout", &self.stall_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("has_tokenizer", &self.tokenizer.is_some())
            .field("chaos", &self.chaos)
            .finish()
    }
}

/// Request counters, context-owned.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    requests: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
    sum_batch_size: AtomicU64,
}

impl Stats {
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, n: u64) {
        self.tokens.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_batch_size(&self, n: u64) {
        self.sum_batch_size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            sum_batch_size: self.sum_batch_size.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the scheduler's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub tokens: u64,
    pub sum_batch_size: u64,
}

impl StatsSnapshot {
    pub fn average_batch_size(&self) -> f64 {
        self.sum_batch_size as f64 / (self.requests.max(1)) as f64
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} requests, {} errors, {} tokens, {:.2} average batch size",
            self.requests,
            self.errors,
            self.tokens,
            self.average_batch_size()
        )
    }
}

/// Shared scheduler state: the consolidated context that replaces every
/// module-level global the subsystem would otherwise need.
pub(crate) struct SchedulerInner {
    pub config: SchedulerConfig,
    pub capacity: Arc<CapacityGauge>,
    pub stats: Stats,
    pub client: reqwest::Client,
    queue: RequestQueue,
    request_ctr: AtomicU64,
    logit_bias_warned: AtomicBool,
    chaos: Mutex<Option<f64>>,
    chaos_warned: AtomicBool,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerInner {
    pub fn tokenizer(&self) -> Option<Arc<dyn Tokenizer>> {
        self.config.tokenizer.clone()
    }

    /// The tokenizer effective for one request: its own, or the scheduler's.
    pub fn tokenizer_for(&self, request: &CompletionRequest) -> Option<Arc<dyn Tokenizer>> {
        request
            .api_config
            .as_ref()
            .and_then(|c| c.tokenizer.clone())
            .or_else(|| self.tokenizer())
    }

    pub fn chaos(&self) -> Option<f64> {
        *self.chaos.lock().expect("chaos flag poisoned")
    }

    pub fn warn_chaos(&self) {
        if !self.chaos_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "chaos fault injection is enabled; provider streams will fail on purpose"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Relaxed)
    }

    fn submit(
        &self,
        request: CompletionRequest,
        request_id: u64,
    ) -> oneshot::Receiver<Result<ResponseSlice>> {
        let (responder, rx) = oneshot::channel();
        self.queue.push(QueueItem {
            request,
            request_id,
            responder,
        });
        rx
    }

    /// Re-enter a request under its original id, ahead of newer work.
    /// Used by stream recovery.
    pub(crate) async fn resubmit(
        self: &Arc<Self>,
        request: CompletionRequest,
        request_id: u64,
    ) -> Result<ResponseSlice> {
        if self.is_shut_down() {
            return Err(StreamError::Shutdown);
        }
        tracing::warn!(request_id, "request failed mid-stream and will be reissued");
        let rx = self.submit(request, request_id);
        rx.await.map_err(|_| StreamError::Shutdown)?
    }
}

/// The batched completion scheduler. Create one per process (or per
/// provider account) inside a Tokio runtime.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Scheduler {
        let capacity = CapacityGauge::new(config.capacity);
        let chaos = config.chaos;
        let inner = Arc::new(SchedulerInner {
            capacity,
            stats: Stats::default(),
            client: reqwest::Client::new(),
            queue: RequestQueue::new(),
            request_ctr: AtomicU64::new(0),
            logit_bias_warned: AtomicBool::new(false),
            chaos: Mutex::new(chaos),
            chaos_warned: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let (descriptor_tx, descriptor_rx) = mpsc::unbounded_channel::<CallDescriptor>();
        let descriptor_rx = Arc::new(tokio::sync::Mutex::new(descriptor_rx));

        let mut tasks = Vec::new();

        let batcher_inner = Arc::clone(&inner);
        tasks.push(tokio::spawn(async move {
            let batcher = Batcher {
                batch_size: batcher_inner.config.batch_size,
                collection_period: batcher_inner.config.maximum_collection_period,
                default_stall_timeout: batcher_inner.config.stall_timeout,
            };
            loop {
                while batcher_inner.capacity.would_throttle() {
                    tokio::time::sleep(THROTTLE_POLL).await;
                }
                for descriptor in batcher.collect(&batcher_inner.queue).await {
                    if descriptor_tx.send(descriptor).is_err() {
                        return;
                    }
                }
            }
        }));

        for _ in 0..inner.config.workers {
            let worker_inner = Arc::clone(&inner);
            let descriptor_rx = Arc::clone(&descriptor_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let descriptor = {
                        let mut rx = descriptor_rx.lock().await;
                        rx.recv().await
                    };
                    match descriptor {
                        Some(descriptor) => driver::run_call(&worker_inner, descriptor).await,
                        None => return,
                    }
                }
            }));
        }

        *inner.tasks.lock().expect("task list poisoned") = tasks;
        Scheduler { inner }
    }

    pub fn with_defaults() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    /// Submit a generation request. Resolves once the driver has opened a
    /// provider call and created this request's slice; tokens are then
    /// consumed incrementally from the returned stream.
    pub async fn complete(&self, mut request: CompletionRequest) -> Result<TokenStream> {
        if self.inner.is_shut_down() {
            return Err(StreamError::Shutdown);
        }
        if !request.echo {
            return Err(StreamError::Configuration(
                "echo must be enabled so dropped streams can be recovered; strip the prompt \
                 prefix in client code"
                    .into(),
            ));
        }

        let eos = self
            .inner
            .tokenizer_for(&request)
            .map(|t| t.eos_token_id())
            .unwrap_or(DEFAULT_EOS_TOKEN_ID);
        if request.truncate_logit_bias(eos)
            && !self.inner.logit_bias_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "logit bias exceeds the provider limit and was truncated to the first 300 \
                 entries; constraints may be violated"
            );
        }

        let request_id = self.inner.request_ctr.fetch_add(1, Ordering::Relaxed);
        let rx = self.inner.submit(request, request_id);
        let slice = rx.await.map_err(|_| StreamError::Shutdown)??;
        Ok(TokenStream::new(slice, Arc::downgrade(&self.inner)))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// `(reserved, total)` token slots.
    pub fn capacity(&self) -> (u64, u64) {
        (self.inner.capacity.reserved(), self.inner.capacity.total())
    }

    pub fn is_available(&self) -> bool {
        !self.inner.is_shut_down()
    }

    /// Enable or disable chaos fault injection. Testing only.
    pub fn set_chaos(&self, chaos: Option<f64>) {
        *self.inner.chaos.lock().expect("chaos flag poisoned") = chaos;
        if chaos.is_some() {
            self.inner.warn_chaos();
        }
    }

    /// Stop all scheduler tasks. Pending and in-flight requests observe
    /// end-of-iteration; new `complete()` calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::Relaxed) {
            return;
        }
        for task in self.inner.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        // drop queued items so their callers unblock
        while self.inner.queue.try_pop().is_some() {}
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
