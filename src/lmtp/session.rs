//! The server-side LMTP session.
//!
//! One [`TokenSession`] per connection. Commands arrive serialized from the
//! transport's reader loop; each `GENERATE` or `SCORE` spawns its own
//! streaming task, so arbitrarily many logical streams multiplex over one
//! transport with `stream_id` as the sole demux key. Closing the session
//! cancels in-flight streams.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunk::FinishReason;
use crate::error::{Result, StreamError};
use crate::lmtp::message::{
    Frame, FrameKind, GenerateArgs, MsgReply, MsgRequest, ScoreArgs, TokenPayload,
};
use crate::lmtp::model::{
    apply_bias, log_softmax, sample, top_logprobs, LocalModel, TokenSink,
};
use crate::lmtp::transport::{FrameSink as _, FrameSource as _, TransportPair};

/// Adapts the session's outbound frame channel into a [`TokenSink`].
struct FrameTokenSink {
    out: mpsc::UnboundedSender<Frame>,
}

impl TokenSink for FrameTokenSink {
    fn emit(&self, payload: TokenPayload) -> Result<()> {
        self.out
            .send(Frame::token(&payload))
            .map_err(|_| StreamError::Lmtp("session transport closed".into()))
    }
}

/// A per-connection LMTP request handler.
pub struct TokenSession {
    model: Arc<dyn LocalModel>,
    out: mpsc::UnboundedSender<Frame>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokenSession {
    /// `out` is the session's outbound frame queue; the transport binding
    /// drains it onto the wire.
    pub fn new(model: Arc<dyn LocalModel>, out: mpsc::UnboundedSender<Frame>) -> TokenSession {
        TokenSession {
            model,
            out,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Dispatch one inbound frame.
    pub async fn handle(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Generate => match serde_json::from_value::<GenerateArgs>(frame.payload) {
                Ok(args) => self.spawn_generate(args),
                Err(err) => tracing::warn!(%err, "undecodable GENERATE payload"),
            },
            FrameKind::Score => match serde_json::from_value::<ScoreArgs>(frame.payload) {
                Ok(args) => self.spawn_score(args),
                Err(err) => tracing::warn!(%err, "undecodable SCORE payload"),
            },
            FrameKind::Msg => self.handle_msg(frame.payload),
            FrameKind::Token => {
                tracing::warn!("unexpected TOKEN frame on the server side, ignoring");
            }
        }
    }

    /// Cancel all in-flight streams.
    pub fn close(&self) {
        for task in self.tasks.lock().expect("session task list poisoned").drain(..) {
            task.abort();
        }
    }

    fn spawn_generate(&self, args: GenerateArgs) {
        let model = Arc::clone(&self.model);
        let sink = FrameTokenSink {
            out: self.out.clone(),
        };
        self.track(tokio::spawn(async move {
            if let Err(error) = generate_stream(model.as_ref(), &sink, &args).await {
                let _ = sink.emit(TokenPayload::failed(args.stream_id, error.to_string()));
            }
        }));
    }

    fn spawn_score(&self, args: ScoreArgs) {
        let model = Arc::clone(&self.model);
        let sink = FrameTokenSink {
            out: self.out.clone(),
        };
        self.track(tokio::spawn(async move {
            if let Err(error) = score_stream(model.as_ref(), &sink, &args).await {
                let _ = sink.emit(TokenPayload::failed(args.stream_id, error.to_string()));
            }
        }));
    }

    fn handle_msg(&self, payload: Value) {
        let request: MsgRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%err, "undecodable MSG payload");
                return;
            }
        };
        let reply = match request.name.as_str() {
            "model_info" => MsgReply {
                stream_id: request.stream_id,
                data: self.model.model_info(),
                error: None,
            },
            other => MsgReply {
                stream_id: request.stream_id,
                data: Value::Null,
                error: Some(format!("unknown request '{other}'")),
            },
        };
        let _ = self.out.send(Frame::new(
            FrameKind::Msg,
            serde_json::to_value(reply).expect("reply serializes"),
        ));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("session task list poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Drop for TokenSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sample tokens step by step, applying logit biases to the raw logits and
/// renormalising with log-softmax before each draw.
async fn generate_stream(
    model: &dyn LocalModel,
    sink: &dyn TokenSink,
    args: &GenerateArgs,
) -> Result<()> {
    let mut ids = args.prompt.clone();
    let bias = args.logit_bias.clone().unwrap_or_default();
    let eos = model.eos_token_id();

    for step in 0..args.max_tokens {
        let mut logits = model.next_logits(&ids).await?;
        apply_bias(&mut logits, &bias);
        let logprobs = log_softmax(&logits);
        let token = sample(&logprobs, args.temperature);
        let logprob = logprobs
            .get(token as usize)
            .copied()
            .unwrap_or(f32::NEG_INFINITY) as f64;
        ids.push(token);

        let finish_reason = if token == eos {
            Some(FinishReason::Eos)
        } else if step + 1 == args.max_tokens {
            Some(FinishReason::Length)
        } else {
            None
        };

        sink.emit(TokenPayload {
            stream_id: args.stream_id,
            token_id: Some(token),
            text: model.decode_token(token),
            logprob,
            top_logprobs: args
                .logprobs
                .map(|k| top_logprobs(&logprobs, k as usize, model)),
            finish_reason,
            error: None,
        })?;

        if finish_reason.is_some() {
            break;
        }
    }
    Ok(())
}

/// Stream the per-token logprobs of a fixed continuation against a prompt.
/// The final token is marked `finish_reason = "stop"`.
async fn score_stream(
    model: &dyn LocalModel,
    sink: &dyn TokenSink,
    args: &ScoreArgs,
) -> Result<()> {
    let mut ids = args.prompt.clone();
    for (i, &token) in args.scored.iter().enumerate() {
        let logits = model.next_logits(&ids).await?;
        let logprobs = log_softmax(&logits);
        let logprob = *logprobs.get(token as usize).ok_or_else(|| {
            StreamError::Lmtp(format!("scored token {token} outside the model vocabulary"))
        })? as f64;
        ids.push(token);

        sink.emit(TokenPayload {
            stream_id: args.stream_id,
            token_id: Some(token),
            text: model.decode_token(token),
            logprob,
            top_logprobs: None,
            finish_reason: (i + 1 == args.scored.len()).then_some(FinishReason::Stop),
            error: None,
        })?;
    }
    Ok(())
}

/// Run a session over a framed transport until the peer closes.
///
/// This is the binding shared by the subprocess worker and in-process
/// hosting: one task drains the session's outbound queue onto the sink while
/// feeding inbound frames to the session.
pub fn serve_transport(model: Arc<dyn LocalModel>, transport: TransportPair) -> JoinHandle<()> {
    let (mut sink, mut source) = transport;
    tokio::spawn(async move {
        let (out, mut out_rx) = mpsc::unbounded_channel();
        let session = TokenSession::new(model, out);
        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                inbound = source.recv() => match inbound {
                    Ok(Some(frame)) => session.handle(frame).await,
                    _ => break,
                },
            }
        }
        session.close();
        let _ = sink.close().await;
    })
}
