//! The tokenizer capability consumed by chat synthesis and stream recovery.
//!
//! The runtime never ships a real BPE implementation; callers plug their own
//! [`Tokenizer`] through [`ApiConfig`](crate::request::ApiConfig) or the
//! scheduler config. [`AsciiTokenizer`] is a self-contained fallback with a
//! stable id space, good enough for tests and for byte-level bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::chunk::ENDOFTEXT;

/// Bytes↔ids conversion and id bookkeeping.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[u32]) -> String;

    /// Decode a single token id.
    fn decode_token(&self, id: u32) -> String {
        self.decode(&[id])
    }

    /// The end-of-text token id.
    fn eos_token_id(&self) -> u32 {
        50256
    }
}

/// A dependency-free fallback tokenizer.
///
/// Segments text into words (with their leading space attached, GPT-style)
/// and single punctuation characters, assigning ids on first sight.
/// `decode(encode(s)) == s` for any input, which is the property recovery
/// and chat synthesis actually rely on.
pub struct AsciiTokenizer {
    state: Mutex<VocabState>,
}

struct VocabState {
    ids: HashMap<String, u32>,
    tokens: Vec<String>,
}

impl AsciiTokenizer {
    pub fn new() -> AsciiTokenizer {
        AsciiTokenizer {
            state: Mutex::new(VocabState {
                ids: HashMap::new(),
                tokens: Vec::new(),
            }),
        }
    }

    fn segment(text: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                current.push(ch);
            } else if ch == ' ' {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                current.push(ch);
            } else {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                segments.push(ch.to_string());
            }
        }
        if !current.is_empty() {
            segments.push(current);
        }
        segments
    }

    fn intern(&self, segment: &str) -> u32 {
        let mut state = self.state.lock().expect("tokenizer vocab poisoned");
        if let Some(&id) = state.ids.get(segment) {
            return id;
        }
        let mut id = state.tokens.len() as u32;
        // never collide with the reserved eos id
        if id >= 50256 {
            id += 1;
        }
        state.ids.insert(segment.to_string(), id);
        state.tokens.push(segment.to_string());
        id
    }

    fn lookup(&self, id: u32) -> Option<String> {
        let state = self.state.lock().expect("tokenizer vocab poisoned");
        let index = if id > 50256 { id - 1 } else { id } as usize;
        state.tokens.get(index).cloned()
    }
}

impl Default for AsciiTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for AsciiTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        // split out eos markers first so they map to the reserved id
        let mut ids = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find(ENDOFTEXT) {
            for segment in Self::segment(&rest[..pos]) {
                ids.push(self.intern(&segment));
            }
            ids.push(self.eos_token_id());
            rest = &rest[pos + ENDOFTEXT.len()..];
        }
        for segment in Self::segment(rest) {
            ids.push(self.intern(&segment));
        }
        ids
    }

    fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id == self.eos_token_id() {
                out.push_str(ENDOFTEXT);
            } else if let Some(token) = self.lookup(id) {
                out.push_str(&token);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let tok = AsciiTokenizer::new();
        for text in [
            "Say this is a test",
            "hello, world!",
            "  double  spaces ",
            "newlines\nand\ttabs",
        ] {
            let ids = tok.encode(text);
            assert_eq!(tok.decode(&ids), text, "round trip failed for {text:?}");
        }
    }

    #[test]
    fn test_leading_space_attaches_to_word() {
        let tok = AsciiTokenizer::new();
        let segments = AsciiTokenizer::segment(" hello world");
        assert_eq!(segments, vec![" hello", " world"]);
    }

    #[test]
    fn test_eos_marker_maps_to_reserved_id() {
        let tok = AsciiTokenizer::new();
        let ids = tok.encode("hi<|endoftext|>");
        assert_eq!(*ids.last().unwrap(), 50256);
        assert_eq!(tok.decode(&ids), "hi<|endoftext|>");
    }

    #[test]
    fn test_ids_stable_across_calls() {
        let tok = AsciiTokenizer::new();
        let first = tok.encode("same text twice");
        let second = tok.encode("same text twice");
        assert_eq!(first, second);
    }

    #[test]
    fn test_vocab_skips_reserved_id() {
        let tok = AsciiTokenizer::new();
        // intern more than 50256 distinct tokens is impractical here; check
        // the mapping helpers directly instead
        assert_eq!(tok.intern("a"), 0);
        assert_eq!(tok.lookup(0).as_deref(), Some("a"));
    }
}
