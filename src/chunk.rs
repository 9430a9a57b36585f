//! The canonical per-token record carried on every stream.
//!
//! Both the remote driver and the LMTP session produce [`TokenChunk`]s; the
//! caller-facing iterators yield them one token at a time regardless of how
//! the provider grouped tokens on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The canonical end-of-text token string.
pub const ENDOFTEXT: &str = "<|endoftext|>";

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The token budget (`max_tokens`) was exhausted.
    Length,
    /// A stop condition matched.
    Stop,
    /// The model emitted its end-of-text token.
    Eos,
    /// The stream ended with an error.
    Error,
}

impl FinishReason {
    /// Parse the provider's string form. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<FinishReason> {
        match s {
            "length" => Some(FinishReason::Length),
            "stop" => Some(FinishReason::Stop),
            "eos" => Some(FinishReason::Eos),
            "error" => Some(FinishReason::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Length => "length",
            FinishReason::Stop => "stop",
            FinishReason::Eos => "eos",
            FinishReason::Error => "error",
        }
    }
}

/// One streamed token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    /// Decoded text of this token. May be empty.
    pub text: String,
    /// Byte offset of `text` into the concatenation of all prior chunk text
    /// for this request. Zero for chat backends, which report no offsets.
    pub text_offset: usize,
    /// Log-probability of this token; `0.0` when the backend reports none.
    pub token_logprob: f64,
    /// The provider's string representation of the token.
    pub token: String,
    /// Top-k alternatives and their log-probabilities. Possibly empty.
    #[serde(default)]
    pub top_logprobs: BTreeMap<String, f64>,
    /// Set on the chunk that carries the stream's finish annotation.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    /// Marks echo-prefix tokens synthesized client-side.
    #[serde(default)]
    pub fixed: bool,
}

impl TokenChunk {
    /// The synthesized terminal chunk for streams that end without a
    /// length-limit finish reason.
    pub fn endoftext() -> TokenChunk {
        let mut top = BTreeMap::new();
        top.insert(ENDOFTEXT.to_string(), 0.0);
        TokenChunk {
            text: ENDOFTEXT.to_string(),
            text_offset: 0,
            token_logprob: 0.0,
            token: ENDOFTEXT.to_string(),
            top_logprobs: top,
            finish_reason: Some(FinishReason::Eos),
            fixed: false,
        }
    }

    /// An echo-prefix chunk: known text, zero logprob, marked `fixed`.
    pub fn echoed(text: impl Into<String>, text_offset: usize) -> TokenChunk {
        let text = text.into();
        let mut top = BTreeMap::new();
        top.insert(text.clone(), 0.0);
        TokenChunk {
            token: text.clone(),
            text,
            text_offset,
            token_logprob: 0.0,
            top_logprobs: top,
            finish_reason: None,
            fixed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_round_trip() {
        for reason in [
            FinishReason::Length,
            FinishReason::Stop,
            FinishReason::Eos,
            FinishReason::Error,
        ] {
            assert_eq!(FinishReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(FinishReason::parse("content_filter"), None);
    }

    #[test]
    fn test_finish_reason_serde_lowercase() {
        let json = serde_json::to_string(&FinishReason::Length).unwrap();
        assert_eq!(json, "\"length\"");
        let back: FinishReason = serde_json::from_str("\"stop\"").unwrap();
        assert_eq!(back, FinishReason::Stop);
    }

    #[test]
    fn test_endoftext_chunk_shape() {
        let chunk = TokenChunk::endoftext();
        assert_eq!(chunk.text, ENDOFTEXT);
        assert_eq!(chunk.token_logprob, 0.0);
        assert_eq!(chunk.top_logprobs.get(ENDOFTEXT), Some(&0.0));
        assert_eq!(chunk.finish_reason, Some(FinishReason::Eos));
        assert!(!chunk.fixed);
    }

    #[test]
    fn test_echoed_chunk_is_fixed() {
        let chunk = TokenChunk::echoed(" hello", 4);
        assert!(chunk.fixed);
        assert_eq!(chunk.text_offset, 4);
        assert_eq!(chunk.token_logprob, 0.0);
    }
}
