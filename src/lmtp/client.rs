//! The LMTP client.
//!
//! One reader task owns the transport's inbound half and dispatches by
//! frame type: `TOKEN` frames fan out to every consumer queue registered
//! under their `stream_id`, `MSG` frames complete one-shot reply futures.
//! Stream ids are client-allocated monotonic integers, unique per session.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, StreamError};
use crate::lmtp::message::{
    Frame, FrameKind, GenerateArgs, MsgReply, MsgRequest, ScoreArgs, TokenPayload,
};
use crate::lmtp::transport::{FrameSink as _, FrameSource as _, TransportPair};

/// Fixed timeout for `MSG` request/reply round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type ConsumerMap = Arc<Mutex<HashMap<u64, Vec<mpsc::UnboundedSender<TokenPayload>>>>>;
type ReplyMap = Arc<Mutex<HashMap<u64, oneshot::Sender<MsgReply>>>>;

enum Outbound {
    Frame(Frame),
    Close,
}

/// Per-stream decoding options for [`LmtpClient::generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Token budget; zero means the protocol default.
    pub max_tokens: Option<u64>,
    pub temperature: f64,
    pub logit_bias: Option<BTreeMap<u32, f64>>,
    /// Top-k alternatives to request per token.
    pub logprobs: Option<u32>,
}

/// Client for a local-model LMTP endpoint over any [`TransportPair`].
pub struct LmtpClient {
    model: String,
    out: mpsc::UnboundedSender<Outbound>,
    streams: ConsumerMap,
    replies: ReplyMap,
    stream_ctr: AtomicU64,
    closed: AtomicBool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LmtpClient {
    pub fn new(transport: TransportPair, model: impl Into<String>) -> LmtpClient {
        let (mut sink, mut source) = transport;
        let streams: ConsumerMap = Arc::new(Mutex::new(HashMap::new()));
        let replies: ReplyMap = Arc::new(Mutex::new(HashMap::new()));

        let (out, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let writer = tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                match item {
                    Outbound::Frame(frame) => {
                        if let Err(error) = sink.send(frame).await {
                            tracing::warn!(%error, "lmtp send failed, stopping writer");
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader_streams = Arc::clone(&streams);
        let reader_replies = Arc::clone(&replies);
        let reader = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(Some(frame)) => {
                        dispatch(&reader_streams, &reader_replies, frame);
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "lmtp transport failed, stopping reader");
                        break;
                    }
                }
            }
            // signal end-of-stream to every open iterator and reply future
            reader_streams.lock().expect("stream map poisoned").clear();
            reader_replies.lock().expect("reply map poisoned").clear();
        });

        LmtpClient {
            model: model.into(),
            out,
            streams,
            replies,
            stream_ctr: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reader,
            writer,
        }
    }

    fn next_stream_id(&self) -> u64 {
        self.stream_ctr.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StreamError::Lmtp("client is closed".into()));
        }
        self.out
            .send(Outbound::Frame(frame))
            .map_err(|_| StreamError::Lmtp("client transport is gone".into()))
    }

    /// Register another consumer queue for an existing stream id.
    pub fn subscribe(&self, stream_id: u64) -> LmtpStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .expect("stream map poisoned")
            .entry(stream_id)
            .or_default()
            .push(tx);
        LmtpStream {
            stream_id,
            rx,
            done: false,
        }
    }

    /// Start a streamed generation; returns an iterator over its tokens.
    pub fn generate(&self, prompt: Vec<u32>, options: GenerateOptions) -> Result<LmtpStream> {
        let stream_id = self.next_stream_id();
        let iterator = self.subscribe(stream_id);
        let args = GenerateArgs {
            stream_id,
            model: self.model.clone(),
            prompt,
            max_tokens: options.max_tokens.unwrap_or(32),
            temperature: options.temperature,
            logit_bias: options.logit_bias.filter(|b| !b.is_empty()),
            logprobs: options.logprobs,
        };
        self.send(Frame::new(
            FrameKind::Generate,
            serde_json::to_value(args)?,
        ))?;
        Ok(iterator)
    }

    /// Stream per-token logprobs of `scored` as a continuation of `prompt`.
    pub fn score(&self, prompt: Vec<u32>, scored: Vec<u32>) -> Result<LmtpStream> {
        let stream_id = self.next_stream_id();
        let iterator = self.subscribe(stream_id);
        let args = ScoreArgs {
            stream_id,
            model: self.model.clone(),
            prompt,
            scored,
        };
        self.send(Frame::new(FrameKind::Score, serde_json::to_value(args)?))?;
        Ok(iterator)
    }

    /// A non-streaming request/reply (e.g. `"model_info"`), with a fixed
    /// 5 second reply timeout.
    pub async fn request(&self, name: &str, data: Value) -> Result<MsgReply> {
        let stream_id = self.next_stream_id();
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .expect("reply map poisoned")
            .insert(stream_id, tx);

        let request = MsgRequest {
            stream_id,
            name: name.to_string(),
            model: Some(self.model.clone()),
            data,
        };
        self.send(Frame::new(FrameKind::Msg, serde_json::to_value(request)?))?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StreamError::Lmtp("client closed before the reply".into())),
            Err(_) => {
                self.replies
                    .lock()
                    .expect("reply map poisoned")
                    .remove(&stream_id);
                Err(StreamError::Timeout(format!(
                    "LMTP request '{name}' timed out after 5 seconds"
                )))
            }
        }
    }

    /// Close the transport. All open streams observe end-of-iteration.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.out.send(Outbound::Close);
        self.streams.lock().expect("stream map poisoned").clear();
        self.replies.lock().expect("reply map poisoned").clear();
    }
}

impl Drop for LmtpClient {
    fn drop(&mut self) {
        self.close();
        self.reader.abort();
        self.writer.abort();
    }
}

fn dispatch(streams: &ConsumerMap, replies: &ReplyMap, frame: Frame) {
    match frame.kind {
        FrameKind::Token => {
            let payload: TokenPayload = match serde_json::from_value(frame.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(%err, "undecodable TOKEN payload");
                    return;
                }
            };
            let mut streams = streams.lock().expect("stream map poisoned");
            if let Some(consumers) = streams.get_mut(&payload.stream_id) {
                consumers.retain(|tx| tx.send(payload.clone()).is_ok());
            }
        }
        FrameKind::Msg => {
            let reply: MsgReply = match serde_json::from_value(frame.payload) {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(%err, "undecodable MSG payload");
                    return;
                }
            };
            if let Some(tx) = replies
                .lock()
                .expect("reply map poisoned")
                .remove(&reply.stream_id)
            {
                let _ = tx.send(reply);
            }
        }
        other => {
            tracing::warn!(kind = other.as_str(), "unexpected frame kind on the client");
        }
    }
}

/// Async iterator over one LMTP stream's tokens.
///
/// Terminates on a frame with `finish_reason` set, on an error frame, or
/// when the client closes. A terminal annotation frame that carries no
/// token ends the stream without yielding.
pub struct LmtpStream {
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<TokenPayload>,
    done: bool,
}

impl LmtpStream {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub async fn next(&mut self) -> Option<Result<TokenPayload>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            None => {
                self.done = true;
                None
            }
            Some(payload) => {
                if let Some(error) = payload.error {
                    self.done = true;
                    return Some(Err(StreamError::Lmtp(error)));
                }
                if payload.finish_reason.is_some() {
                    self.done = true;
                    if payload.token_id.is_none() {
                        return None;
                    }
                }
                Some(Ok(payload))
            }
        }
    }

    /// Drain the stream into a vector of payloads.
    pub async fn collect(&mut self) -> Result<Vec<TokenPayload>> {
        let mut payloads = Vec::new();
        while let Some(item) = self.next().await {
            payloads.push(item?);
        }
        Ok(payloads)
    }
}

/// A reference-counted handle to a shared client.
///
/// The interpreter side hands one model client to many concurrent queries;
/// the underlying transport closes only when the last reference releases.
pub struct ClientRef {
    client: Arc<LmtpClient>,
    refs: Arc<AtomicUsize>,
}

impl ClientRef {
    pub fn new(client: LmtpClient) -> ClientRef {
        ClientRef {
            client: Arc::new(client),
            refs: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Hand out another reference.
    pub fn clone_ref(&self) -> ClientRef {
        self.refs.fetch_add(1, Ordering::Relaxed);
        ClientRef {
            client: Arc::clone(&self.client),
            refs: Arc::clone(&self.refs),
        }
    }

    /// Release this reference; the transport closes with the last one.
    pub fn release(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "ClientRef released more times than acquired");
        if previous == 1 {
            self.client.close();
        }
    }
}

impl std::ops::Deref for ClientRef {
    type Target = LmtpClient;

    fn deref(&self) -> &LmtpClient {
        &self.client
    }
}
