//! LMTP frame model and wire codecs.
//!
//! Every message is one frame: a type tag plus a payload object carrying a
//! `stream_id`, the sole demultiplexing key of a session. Two bindings share
//! this model: the websocket transport encodes a frame as the text
//! `"<TYPE> <json>"` where `<json>` is a single-element array holding the
//! payload, and the pipe transport sends one `["TYPE", payload]` JSON record
//! per line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chunk::FinishReason;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client→server: start a streamed generation.
    Generate,
    /// Client→server: stream per-token logprobs of a fixed continuation.
    Score,
    /// Request/reply for non-streaming operations, both directions.
    Msg,
    /// Server→client: one streamed result token.
    Token,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Generate => "GENERATE",
            FrameKind::Score => "SCORE",
            FrameKind::Msg => "MSG",
            FrameKind::Token => "TOKEN",
        }
    }

    /// Parse a wire tag. Unknown tags map to `None` and are ignored.
    pub fn parse(s: &str) -> Option<FrameKind> {
        match s {
            "GENERATE" => Some(FrameKind::Generate),
            "SCORE" => Some(FrameKind::Score),
            "MSG" => Some(FrameKind::Msg),
            "TOKEN" => Some(FrameKind::Token),
            _ => None,
        }
    }
}

/// One framed LMTP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Value) -> Frame {
        Frame { kind, payload }
    }

    pub fn token(payload: &TokenPayload) -> Frame {
        Frame {
            kind: FrameKind::Token,
            payload: serde_json::to_value(payload).expect("token payload serializes"),
        }
    }

    /// The websocket text form: `"<TYPE> [<payload>]"`.
    pub fn to_ws_text(&self) -> String {
        let wrapped = Value::Array(vec![self.payload.clone()]);
        format!("{} {}", self.kind.as_str(), wrapped)
    }

    /// Parse the websocket text form. `None` for unknown types or
    /// undecodable payloads; callers log and skip those.
    pub fn from_ws_text(text: &str) -> Option<Frame> {
        let (tag, body) = text.split_once(' ')?;
        let kind = FrameKind::parse(tag)?;
        let value: Value = serde_json::from_str(body).ok()?;
        let payload = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        Some(Frame { kind, payload })
    }

    /// The pipe form: one `["TYPE", payload]` record per line.
    pub fn to_line(&self) -> String {
        json!([self.kind.as_str(), self.payload]).to_string()
    }

    /// Parse the pipe form. `None` for unknown types or malformed records.
    pub fn from_line(line: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let items = value.as_array()?;
        if items.len() != 2 {
            return None;
        }
        let kind = FrameKind::parse(items[0].as_str()?)?;
        Some(Frame {
            kind,
            payload: items[1].clone(),
        })
    }
}

fn default_max_tokens() -> u64 {
    32
}

/// Payload of a `GENERATE` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateArgs {
    pub stream_id: u64,
    pub model: String,
    pub prompt: Vec<u32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub temperature: f64,
    /// Additive logit biases, applied before sampling each step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<u32, f64>>,
    /// Top-k alternatives to report per token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<u32>,
}

/// Payload of a `SCORE` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreArgs {
    pub stream_id: u64,
    pub model: String,
    pub prompt: Vec<u32>,
    /// The continuation whose per-token logprobs are streamed back.
    pub scored: Vec<u32>,
}

/// Payload of an outbound `MSG` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgRequest {
    pub stream_id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a `MSG` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgReply {
    pub stream_id: u64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a streamed `TOKEN` frame.
///
/// A frame with `finish_reason` set and no `token_id` is a pure end
/// annotation: it terminates the stream without contributing a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub stream_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub logprob: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenPayload {
    /// A terminal annotation frame carrying no token.
    pub fn end(stream_id: u64, finish_reason: FinishReason) -> TokenPayload {
        TokenPayload {
            stream_id,
            token_id: None,
            text: String::new(),
            logprob: 0.0,
            top_logprobs: None,
            finish_reason: Some(finish_reason),
            error: None,
        }
    }

    /// A terminal error frame.
    pub fn failed(stream_id: u64, error: impl Into<String>) -> TokenPayload {
        TokenPayload {
            stream_id,
            token_id: None,
            text: String::new(),
            logprob: 0.0,
            top_logprobs: None,
            finish_reason: None,
            error: Some(error.into()),
        }
    }
}
