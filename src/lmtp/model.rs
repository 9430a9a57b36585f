//! The local-model capability and the sampling math shared by GENERATE and
//! SCORE.
//!
//! A [`LocalModel`] exposes one step of raw logits for a token prefix; the
//! session applies logit biases, renormalises with log-softmax, and samples.
//! Keeping the bias/softmax math out of the model keeps every backend's
//! scoring identical to its generation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::lmtp::message::TokenPayload;

/// A locally hosted model: one logits step per call.
#[async_trait]
pub trait LocalModel: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn eos_token_id(&self) -> u32;

    /// Decode a single token id to text.
    fn decode_token(&self, id: u32) -> String;

    /// Model metadata for `MSG model_info` replies.
    fn model_info(&self) -> Value;

    /// Raw (unnormalised) logits for the next token after `input_ids`.
    async fn next_logits(&self, input_ids: &[u32]) -> Result<Vec<f32>>;
}

/// Receives streamed tokens produced by a model-driving loop.
pub trait TokenSink: Send + Sync {
    fn emit(&self, payload: TokenPayload) -> Result<()>;
}

/// `log_softmax` over raw logits.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_z = max + sum.ln();
    logits.iter().map(|l| l - log_z).collect()
}

/// Add per-token-id biases to raw logits in place.
pub fn apply_bias(logits: &mut [f32], bias: &BTreeMap<u32, f64>) {
    for (&id, &b) in bias {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit += b as f32;
        }
    }
}

/// Sample a token from renormalised logprobs. Temperature zero is greedy.
pub fn sample(logprobs: &[f32], temperature: f64) -> u32 {
    if temperature <= 0.0 {
        return argmax(logprobs);
    }
    let weights: Vec<f64> = logprobs
        .iter()
        .map(|lp| (*lp as f64 / temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return argmax(logprobs);
    }
    let mut draw = fastrand::f64() * total;
    for (i, w) in weights.iter().enumerate() {
        draw -= w;
        if draw <= 0.0 {
            return i as u32;
        }
    }
    (logprobs.len() - 1) as u32
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// The `k` most likely tokens and their logprobs, decoded for the wire.
pub fn top_logprobs(
    logprobs: &[f32],
    k: usize,
    model: &dyn LocalModel,
) -> BTreeMap<String, f64> {
    let mut indexed: Vec<(usize, f32)> = logprobs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
        .into_iter()
        .take(k)
        .map(|(i, lp)| (model.decode_token(i as u32), lp as f64))
        .collect()
}

/// A deterministic model for tests: logits are a pure function of the
/// input-id prefix, so scoring a generated sequence reproduces the
/// generation's logprobs exactly. The eos token is strongly disfavoured
/// unless biased back in.
pub struct MockModel {
    vocab_size: usize,
    seed: u64,
}

impl MockModel {
    pub fn new(vocab_size: usize, seed: u64) -> MockModel {
        MockModel { vocab_size, seed }
    }

    fn mix(mut state: u64) -> u64 {
        state = state.wrapping_add(0x9e3779b97f4a7c15);
        state = (state ^ (state >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        state = (state ^ (state >> 27)).wrapping_mul(0x94d049bb133111eb);
        state ^ (state >> 31)
    }
}

#[async_trait]
impl LocalModel for MockModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token_id(&self) -> u32 {
        0
    }

    fn decode_token(&self, id: u32) -> String {
        if id == self.eos_token_id() {
            crate::chunk::ENDOFTEXT.to_string()
        } else {
            format!("t{id} ")
        }
    }

    fn model_info(&self) -> Value {
        serde_json::json!({
            "model": "mock",
            "model_type": "mock",
            "vocab_size": self.vocab_size,
        })
    }

    async fn next_logits(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
        let mut state = self.seed;
        for &id in input_ids {
            state = Self::mix(state ^ id as u64);
        }
        let logits = (0..self.vocab_size)
            .map(|i| {
                if i == self.eos_token_id() as usize {
                    -10.0
                } else {
                    let h = Self::mix(state ^ (i as u64).wrapping_mul(0x100000001b3));
                    (h % 1000) as f32 / 250.0 - 2.0
                }
            })
            .collect();
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_softmax_normalises() {
        let logprobs = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = logprobs.iter().map(|lp| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        // order preserved
        assert!(logprobs[2] > logprobs[1] && logprobs[1] > logprobs[0]);
    }

    #[test]
    fn test_apply_bias_shifts_selected_ids() {
        let mut logits = vec![0.0, 0.0, 0.0];
        let mut bias = BTreeMap::new();
        bias.insert(1u32, 5.0);
        apply_bias(&mut logits, &bias);
        assert_eq!(logits, vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_bias_out_of_range_ignored() {
        let mut logits = vec![0.0, 0.0];
        let mut bias = BTreeMap::new();
        bias.insert(99u32, 5.0);
        apply_bias(&mut logits, &bias);
        assert_eq!(logits, vec![0.0, 0.0]);
    }

    #[test]
    fn test_greedy_sampling_is_argmax() {
        let logprobs = log_softmax(&[0.0, 3.0, 1.0]);
        assert_eq!(sample(&logprobs, 0.0), 1);
    }

    #[test]
    fn test_sampling_stays_in_vocab() {
        let logprobs = log_softmax(&[0.5, 0.5, 0.5, 0.5]);
        for _ in 0..100 {
            assert!(sample(&logprobs, 1.0) < 4);
        }
    }

    #[tokio::test]
    async fn test_mock_model_deterministic() {
        let model = MockModel::new(16, 42);
        let a = model.next_logits(&[1, 2, 3]).await.unwrap();
        let b = model.next_logits(&[1, 2, 3]).await.unwrap();
        assert_eq!(a, b);
        let c = model.next_logits(&[1, 2, 4]).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_mock_model_disfavours_eos() {
        let model = MockModel::new(16, 42);
        let logits = model.next_logits(&[5]).await.unwrap();
        let lp = log_softmax(&logits);
        assert_ne!(argmax(&lp), model.eos_token_id());
    }

    #[test]
    fn test_top_logprobs_sorted_and_decoded() {
        let model = MockModel::new(4, 1);
        let lp = log_softmax(&[0.0, 3.0, 1.0, 2.0]);
        let top = top_logprobs(&lp, 2, &model);
        assert_eq!(top.len(), 2);
        assert!(top.contains_key("t1 "));
        assert!(top.contains_key("t3 "));
    }
}
