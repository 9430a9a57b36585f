//! The provider stream driver.
//!
//! One [`CallDescriptor`] becomes one streamed HTTP POST. The driver builds
//! the chat or completion body, opens the response, demultiplexes parsed SSE
//! records into the members' slices by choice index, and watches for chunk
//! stalls with a 500 ms timer. Descriptor-level failures are retried with
//! randomized exponential backoff before any chunk is delivered; after that,
//! errors flow to the slices as recovery or failure items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};

use crate::capacity::CapacityReservation;
use crate::chunk::{FinishReason, TokenChunk};
use crate::error::{Result, StreamError};
use crate::chat;
use crate::remote::batcher::CallDescriptor;
use crate::remote::scheduler::SchedulerInner;
use crate::remote::slice::{slice_pair, SliceHandle};
use crate::remote::sse::SseDecoder;
use crate::request::{rejects_echo_logprobs, CompletionRequest, ErrorPolicy};
use crate::tokenizer::Tokenizer;
use crate::trace::{emit, TraceEvent};

const CHUNK_TIMER_TICK: Duration = Duration::from_millis(500);

/// Default completion-endpoint token budget when the caller passed `-1`.
const COMPLETION_DEFAULT_MAX_TOKENS: i64 = 1024;

/// Everything `drive_stream` needs besides the handles.
struct CallContext {
    chat: bool,
    stall_timeout: Duration,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    chaos: Option<f64>,
    /// Chat streams get a single leading space on their first content
    /// fragment so downstream boundary detection matches the completion
    /// endpoint.
    leading_space_pending: bool,
}

/// A successfully opened provider call, futures not yet resolved.
struct OpenedCall {
    /// `None` when no HTTP call is needed (chat echo with a zero budget).
    response: Option<reqwest::Response>,
    reservations: Vec<CapacityReservation>,
    /// Client-synthesized echo-prefix chunks, one list per member.
    echo_chunks: Vec<Vec<TokenChunk>>,
    leading_space_pending: bool,
}

/// Execute one descriptor end to end: retry the call open, resolve the
/// members' futures with their slices, then drive the stream to completion.
pub(crate) async fn run_call(inner: &Arc<SchedulerInner>, descriptor: CallDescriptor) {
    let policy = descriptor
        .api_config
        .as_ref()
        .map(|c| c.errors)
        .unwrap_or_default();
    let trace = descriptor.members[0].request.trace.clone();

    let mut attempt: u32 = 0;
    let opened = loop {
        match open_call(inner, &descriptor).await {
            Ok(opened) => break opened,
            Err(error) => {
                inner.stats.inc_errors();
                attempt += 1;
                let fatal = error.is_definitive()
                    || policy == ErrorPolicy::Raise
                    || attempt > inner.config.maximum_retries;
                if fatal {
                    for member in descriptor.members {
                        let _ = member.responder.send(Err(error.clone_shallow()));
                    }
                    return;
                }
                let delay = backoff_delay(&error, attempt);
                tracing::warn!(
                    %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "provider call failed, backing off"
                );
                emit(
                    &trace,
                    TraceEvent::Retry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: error.to_string(),
                    },
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let OpenedCall {
        response,
        reservations,
        echo_chunks,
        leading_space_pending,
    } = opened;

    inner.stats.inc_requests();
    inner.stats.add_batch_size(descriptor.members.len() as u64);
    emit(
        &trace,
        TraceEvent::Batch {
            size: descriptor.members.len(),
        },
    );

    // resolve the members' futures with their slices before any chunk
    let mut handles: Vec<SliceHandle> = Vec::with_capacity(descriptor.members.len());
    for (member, reservation) in descriptor.members.into_iter().zip(reservations) {
        let wait_timeout = member
            .request
            .timeout
            .unwrap_or(inner.config.stream_timeout);
        let (handle, slice) = slice_pair(
            member.request,
            member.request_id,
            wait_timeout,
            inner.config.maximum_retries,
            reservation,
        );
        let _ = member.responder.send(Ok(slice));
        handles.push(handle);
    }

    for (handle, chunks) in handles.iter().zip(echo_chunks) {
        for chunk in chunks {
            handle.push(chunk);
        }
    }

    let context = CallContext {
        chat: descriptor.chat,
        stall_timeout: descriptor.stall_timeout,
        tokenizer: descriptor
            .api_config
            .as_ref()
            .and_then(|c| c.tokenizer.clone())
            .or_else(|| inner.tokenizer()),
        chaos: inner.chaos(),
        leading_space_pending,
    };

    let outcome = match response {
        Some(response) => drive_stream(inner, context, &mut handles, response).await,
        None => Ok(()),
    };

    match outcome {
        Ok(()) => {
            for handle in handles.iter_mut() {
                handle.finish();
            }
        }
        Err(error) => {
            inner.stats.inc_errors();
            tracing::warn!(%error, "provider stream failed mid-call");
            let definitive = error.is_definitive() || policy == ErrorPolicy::Raise;
            for handle in handles.iter_mut().filter(|h| !h.is_closed()) {
                if definitive {
                    handle.fail(error.clone_shallow());
                } else {
                    handle.recover(error.clone_shallow());
                }
            }
        }
    }
}

/// Reserve capacity, resolve the endpoint, and open the streamed response.
/// Reservations drop (and release) if any step fails.
async fn open_call(inner: &Arc<SchedulerInner>, descriptor: &CallDescriptor) -> Result<OpenedCall> {
    let first = &descriptor.members[0].request;
    let tokenizer = descriptor
        .api_config
        .as_ref()
        .and_then(|c| c.tokenizer.clone())
        .or_else(|| inner.tokenizer());

    // reservations are taken before dispatch and live as long as the slices
    let mut reservations = Vec::with_capacity(descriptor.members.len());
    for member in &descriptor.members {
        let cost = if descriptor.chat {
            member.request.max_tokens.max(1) as u64
        } else {
            1
        };
        reservations.push(inner.capacity.acquire(cost).await);
    }

    let mut echo_chunks: Vec<Vec<TokenChunk>> = vec![Vec::new(); descriptor.members.len()];
    let mut leading_space_pending = false;

    let body = if descriptor.chat {
        let request = first;
        if !request.logit_bias.is_empty() {
            return Err(StreamError::ApiLimitation(
                "chat models do not support logit_bias constraints".into(),
            ));
        }
        let tokenizer = tokenizer.as_deref().ok_or_else(|| {
            StreamError::Configuration("chat models require a configured tokenizer".into())
        })?;
        let prompt_text = request.prompt.as_text(tokenizer);
        if request.echo {
            echo_chunks[0] = echo_prefix(&prompt_text, tokenizer);
        }
        if request.max_tokens == 0 {
            // nothing to generate: the echo prefix is the whole stream
            return Ok(OpenedCall {
                response: None,
                reservations,
                echo_chunks,
                leading_space_pending: false,
            });
        }
        leading_space_pending = true;
        build_chat_body(request, &prompt_text)
    } else {
        let mut echo_override = None;
        if first.echo && rejects_echo_logprobs(&first.model) {
            if first.max_tokens == 0 {
                return Err(StreamError::ApiLimitation(format!(
                    "model '{}' rejects echo scoring; use a different model for scoring-only calls",
                    first.model
                )));
            }
            let tokenizer = tokenizer.as_deref().ok_or_else(|| {
                StreamError::Configuration(
                    "echo synthesis for this model requires a configured tokenizer".into(),
                )
            })?;
            for (i, member) in descriptor.members.iter().enumerate() {
                let prompt_text = member.request.prompt.as_text(tokenizer);
                echo_chunks[i] = echo_prefix(&prompt_text, tokenizer);
            }
            echo_override = Some(false);
        }
        build_completion_body(descriptor, echo_override)
    };

    let endpoint = crate::remote::endpoint::resolve(
        &first.model,
        descriptor.api_config.as_ref(),
        descriptor.chat,
    )?;

    if descriptor
        .api_config
        .as_ref()
        .map(|c| c.is_verbose())
        .unwrap_or(false)
    {
        tracing::info!(url = %endpoint.url, body = %body, "provider call");
    }
    emit(
        &first.trace,
        TraceEvent::Call {
            endpoint: endpoint.url.clone(),
            model: first.model.clone(),
        },
    );

    let mut builder = inner.client.post(&endpoint.url).json(&body);
    for (name, value) in &endpoint.headers {
        builder = builder.header(name, value);
    }

    let response = tokio::time::timeout(inner.config.connect_timeout, builder.send())
        .await
        .map_err(|_| StreamError::Timeout("provider connect timed out".into()))??;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        if let Some(message) = error_message(&body) {
            return Err(StreamError::from_provider_message(message));
        }
        return Err(StreamError::Http {
            status: status.as_u16(),
            body,
            retry_after,
        });
    }

    Ok(OpenedCall {
        response: Some(response),
        reservations,
        echo_chunks,
        leading_space_pending,
    })
}

/// Read the SSE stream to completion, demultiplexing records into slices.
async fn drive_stream(
    inner: &SchedulerInner,
    mut context: CallContext,
    handles: &mut [SliceHandle],
    response: reqwest::Response,
) -> Result<()> {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();
    let mut last_chunk = Instant::now();

    loop {
        let tick = tokio::time::sleep(CHUNK_TIMER_TICK);
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(bytes)) => {
                    let records = decoder.decode(&bytes);
                    if !records.is_empty() {
                        last_chunk = Instant::now();
                    }
                    for record in records {
                        process_record(inner, &mut context, handles, &record)?;
                    }
                    if decoder.is_done() {
                        break;
                    }
                }
                Some(Err(error)) => return Err(error.into()),
                None => break,
            },
            _ = tick => {
                if last_chunk.elapsed() > context.stall_timeout {
                    return Err(StreamError::Timeout(
                        "token stream took too long to produce the next chunk".into(),
                    ));
                }
            }
        }
    }

    for record in decoder.flush() {
        process_record(inner, &mut context, handles, &record)?;
    }

    if !decoder.is_done() {
        // the tail may carry a final provider error object
        if let Ok(value) = serde_json::from_str::<Value>(decoder.remainder()) {
            if let Some(message) = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
            {
                return Err(StreamError::from_provider_message(message));
            }
        }
        return Err(StreamError::Stream(
            "stream ended before the [DONE] sentinel".into(),
        ));
    }

    Ok(())
}

/// Route one parsed SSE record's choices into the slices.
fn process_record(
    inner: &SchedulerInner,
    context: &mut CallContext,
    handles: &mut [SliceHandle],
    record: &Value,
) -> Result<()> {
    if let Some(chaos) = context.chaos {
        inner.warn_chaos();
        if fastrand::f64() < chaos {
            return Err(StreamError::Stream("chaos fault injected".into()));
        }
    }

    if let Some(message) = record
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Err(StreamError::from_provider_message(format!(
            "{message} (local reserved capacity {}/{})",
            inner.capacity.reserved(),
            inner.capacity.total()
        )));
    }

    let Some(choices) = record.get("choices").and_then(|c| c.as_array()) else {
        tracing::warn!(%record, "record without choices, skipping");
        return Ok(());
    };

    for choice in choices {
        let index = choice.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
        let Some(handle) = handles.get_mut(index) else {
            tracing::warn!(index, "choice index out of range for this batch");
            continue;
        };

        let finish = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .and_then(FinishReason::parse);

        let chunks = if context.chat {
            let Some(delta) = choice.get("delta") else {
                handle.note_finish(finish);
                continue;
            };
            let Some(content) = delta.get("content").and_then(|c| c.as_str()) else {
                // an empty delta object annotates end-of-stream; anything
                // else is a non-content annotation we skip
                if delta.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                    handle.note_finish(finish);
                }
                continue;
            };
            if content.is_empty() {
                handle.note_finish(finish);
                continue;
            }
            let tokenizer = context.tokenizer.as_deref().ok_or_else(|| {
                StreamError::Configuration("chat models require a configured tokenizer".into())
            })?;
            let text = if context.leading_space_pending {
                context.leading_space_pending = false;
                format!(" {content}")
            } else {
                content.to_string()
            };
            chat_chunks(&text, tokenizer, finish)
        } else {
            completion_chunks(choice, finish)
        };

        inner.stats.add_tokens(chunks.len() as u64);
        emit(
            &handle.request().trace,
            TraceEvent::Tokens {
                count: chunks.len(),
            },
        );
        handle.note_finish(finish);
        for chunk in chunks {
            handle.push(chunk);
        }
    }

    Ok(())
}

/// Split one completion-endpoint choice into per-token chunks.
fn completion_chunks(choice: &Value, finish: Option<FinishReason>) -> Vec<TokenChunk> {
    let text = choice.get("text").and_then(|t| t.as_str()).unwrap_or("");
    let Some(logprobs) = choice.get("logprobs").filter(|l| l.is_object()) else {
        // logprobs were not requested: the whole fragment is one chunk
        if text.is_empty() {
            return Vec::new();
        }
        let mut chunk = TokenChunk::echoed(text, 0);
        chunk.fixed = false;
        chunk.finish_reason = finish;
        return vec![chunk];
    };

    let tokens: Vec<String> = logprobs
        .get("tokens")
        .and_then(|t| t.as_array())
        .map(|a| {
            a.iter()
                .map(|t| t.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();
    let token_logprobs = logprobs
        .get("token_logprobs")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    let offsets: Vec<usize> = logprobs
        .get("text_offset")
        .and_then(|t| t.as_array())
        .map(|a| {
            a.iter()
                .map(|o| o.as_u64().unwrap_or(0) as usize)
                .collect()
        })
        .unwrap_or_default();
    let top_logprobs = logprobs
        .get("top_logprobs")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();

    let base = offsets.first().copied().unwrap_or(0);
    let mut chunks = Vec::with_capacity(tokens.len());
    for (j, token) in tokens.iter().enumerate() {
        let start = offsets.get(j).map(|o| o - base).unwrap_or(0);
        let end = offsets
            .get(j + 1)
            .map(|o| o - base)
            .unwrap_or_else(|| text.len());
        let chunk_text = text.get(start..end).unwrap_or("").to_string();

        let top = top_logprobs
            .get(j)
            .and_then(|t| t.as_object())
            .map(|o| {
                o.iter()
                    .map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0)))
                    .collect()
            })
            .unwrap_or_default();

        chunks.push(TokenChunk {
            text: chunk_text,
            text_offset: offsets.get(j).copied().unwrap_or(0),
            token_logprob: token_logprobs
                .get(j)
                .and_then(|l| l.as_f64())
                .unwrap_or(0.0),
            token: token.clone(),
            top_logprobs: top,
            finish_reason: if j + 1 == tokens.len() { finish } else { None },
            fixed: false,
        });
    }
    chunks
}

/// Synthesize per-token chunks for a chat content fragment: locally
/// tokenized, zero offsets and logprobs, singleton top-logprob maps.
fn chat_chunks(
    text: &str,
    tokenizer: &dyn Tokenizer,
    finish: Option<FinishReason>,
) -> Vec<TokenChunk> {
    let ids = tokenizer.encode(text);
    let mut chunks = Vec::with_capacity(ids.len());
    for (j, id) in ids.iter().enumerate() {
        let token = tokenizer.decode_token(*id);
        let mut top = std::collections::BTreeMap::new();
        top.insert(token.clone(), 0.0);
        chunks.push(TokenChunk {
            text: token.clone(),
            text_offset: 0,
            token_logprob: 0.0,
            token,
            top_logprobs: top,
            finish_reason: if j + 1 == ids.len() { finish } else { None },
            fixed: false,
        });
    }
    chunks
}

/// Fixed chunks replaying a prompt that the provider will not echo.
fn echo_prefix(prompt_text: &str, tokenizer: &dyn Tokenizer) -> Vec<TokenChunk> {
    let ids = tokenizer.encode(prompt_text);
    let mut chunks = Vec::with_capacity(ids.len());
    let mut offset = 0;
    for id in ids {
        let token = tokenizer.decode_token(id);
        let chunk = TokenChunk::echoed(token.clone(), offset);
        offset += token.len();
        chunks.push(chunk);
    }
    chunks
}

fn build_completion_body(descriptor: &CallDescriptor, echo_override: Option<bool>) -> Value {
    let first = &descriptor.members[0].request;
    let prompts: Vec<Value> = descriptor
        .members
        .iter()
        .map(|m| m.request.prompt.to_value())
        .collect();
    let max_tokens = if first.max_tokens == -1 {
        COMPLETION_DEFAULT_MAX_TOKENS
    } else {
        first.max_tokens
    };

    let mut body = json!({
        "model": first.model,
        "prompt": prompts,
        "max_tokens": max_tokens,
        "temperature": first.temperature,
        "logprobs": first.logprobs,
        "echo": echo_override.unwrap_or(first.echo),
        "stream": true,
    });
    if !first.logit_bias.is_empty() {
        body["logit_bias"] = json!(first.logit_bias);
    }
    if let Some(user) = &first.user {
        body["user"] = json!(user);
    }
    for (key, value) in &first.hints {
        body[key] = value.clone();
    }
    body
}

fn build_chat_body(request: &CompletionRequest, prompt_text: &str) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": chat::to_messages(prompt_text),
        "temperature": request.temperature,
        "stream": true,
    });
    if request.max_tokens >= 0 {
        body["max_tokens"] = json!(request.max_tokens);
    }
    if let Some(user) = &request.user {
        body["user"] = json!(user);
    }
    for (key, value) in &request.hints {
        body[key] = value.clone();
    }
    body
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn backoff_delay(error: &StreamError, attempt: u32) -> Duration {
    if let StreamError::Http {
        retry_after: Some(retry_after),
        ..
    } = error
    {
        return *retry_after;
    }
    if error.is_backpressure() {
        let factor = 2.0 * fastrand::f64();
        let secs = factor.powi(attempt as i32).min(60.0);
        return Duration::from_secs_f64(0.5 + secs);
    }
    Duration::from_millis(500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::batcher::QueueItem;
    use crate::request::Prompt;
    use crate::tokenizer::AsciiTokenizer;
    use tokio::sync::oneshot;

    fn descriptor(requests: Vec<CompletionRequest>, chat: bool) -> CallDescriptor {
        let members = requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| {
                let (responder, _rx) = oneshot::channel();
                QueueItem {
                    request,
                    request_id: i as u64,
                    responder,
                }
            })
            .collect();
        CallDescriptor {
            members,
            chat,
            api_config: None,
            stall_timeout: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_completion_body_shape() {
        let requests = vec![
            CompletionRequest::new("text-davinci-003", "A")
                .with_max_tokens(8)
                .with_logprobs(5),
            CompletionRequest::new("text-davinci-003", "B")
                .with_max_tokens(8)
                .with_logprobs(5),
        ];
        let body = build_completion_body(&descriptor(requests, false), None);
        assert_eq!(body["prompt"], json!(["A", "B"]));
        assert_eq!(body["max_tokens"], 8);
        assert_eq!(body["echo"], true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["logprobs"], 5);
        assert!(body.get("logit_bias").is_none());
    }

    #[test]
    fn test_completion_body_forces_1024_for_unbounded() {
        let requests = vec![CompletionRequest::new("text-davinci-003", "A")];
        let body = build_completion_body(&descriptor(requests, false), None);
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn test_completion_body_id_prompts() {
        let requests = vec![
            CompletionRequest::new("text-davinci-003", Prompt::Ids(vec![1, 2])).with_max_tokens(4),
        ];
        let body = build_completion_body(&descriptor(requests, false), None);
        assert_eq!(body["prompt"], json!([[1, 2]]));
    }

    #[test]
    fn test_chat_body_omits_max_tokens_when_unbounded() {
        let request = CompletionRequest::new("gpt-4", "<lmql:system/>S<lmql:user/>U");
        let body = build_chat_body(&request, "<lmql:system/>S<lmql:user/>U");
        assert!(body.get("max_tokens").is_none());
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "S"},
                {"role": "user", "content": "U"},
            ])
        );
        assert!(body.get("logprobs").is_none());
        assert!(body.get("echo").is_none());
    }

    #[test]
    fn test_chat_body_keeps_explicit_max_tokens() {
        let request = CompletionRequest::new("gpt-4", "hi").with_max_tokens(16);
        let body = build_chat_body(&request, "hi");
        assert_eq!(body["max_tokens"], 16);
    }

    #[test]
    fn test_completion_chunks_split_per_token() {
        let choice = json!({
            "index": 0,
            "text": " one two",
            "finish_reason": "length",
            "logprobs": {
                "tokens": [" one", " two"],
                "token_logprobs": [-0.1, -0.2],
                "text_offset": [10, 14],
                "top_logprobs": [{" one": -0.1}, {" two": -0.2}],
            },
        });
        let chunks = completion_chunks(&choice, Some(FinishReason::Length));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, " one");
        assert_eq!(chunks[0].text_offset, 10);
        assert_eq!(chunks[0].token_logprob, -0.1);
        assert_eq!(chunks[0].finish_reason, None);
        assert_eq!(chunks[1].text, " two");
        assert_eq!(chunks[1].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_completion_chunks_null_logprob_becomes_zero() {
        let choice = json!({
            "index": 0,
            "text": "A",
            "finish_reason": null,
            "logprobs": {
                "tokens": ["A"],
                "token_logprobs": [null],
                "text_offset": [0],
                "top_logprobs": [null],
            },
        });
        let chunks = completion_chunks(&choice, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_logprob, 0.0);
        assert!(chunks[0].top_logprobs.is_empty());
    }

    #[test]
    fn test_completion_chunks_without_logprobs() {
        let choice = json!({"index": 0, "text": "plain", "finish_reason": null});
        let chunks = completion_chunks(&choice, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "plain");
        assert!(!chunks[0].fixed);
    }

    #[test]
    fn test_chat_chunks_synthesize_offsets_and_logprobs() {
        let tokenizer = AsciiTokenizer::new();
        let chunks = chat_chunks(" hello world", &tokenizer, Some(FinishReason::Stop));
        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, " hello world");
        for chunk in &chunks {
            assert_eq!(chunk.text_offset, 0);
            assert_eq!(chunk.token_logprob, 0.0);
            assert_eq!(chunk.top_logprobs.len(), 1);
            assert_eq!(chunk.top_logprobs.get(&chunk.token), Some(&0.0));
        }
        assert_eq!(chunks.last().unwrap().finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_echo_prefix_marks_fixed_and_offsets() {
        let tokenizer = AsciiTokenizer::new();
        let chunks = echo_prefix("ab cd", &tokenizer);
        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "ab cd");
        assert!(chunks.iter().all(|c| c.fixed && c.token_logprob == 0.0));
        let mut offset = 0;
        for chunk in &chunks {
            assert_eq!(chunk.text_offset, offset);
            offset += chunk.text.len();
        }
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message("{\"error\": {\"message\": \"boom\"}}").as_deref(),
            Some("boom")
        );
        assert_eq!(error_message("not json"), None);
    }

    #[test]
    fn test_backoff_respects_retry_after() {
        let error = StreamError::Http {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(backoff_delay(&error, 3), Duration::from_secs(7));
    }

    #[test]
    fn test_backoff_grows_for_backpressure() {
        let error = StreamError::RateLimit("rate limit".into());
        for attempt in 0..10 {
            let delay = backoff_delay(&error, attempt);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_secs_f64(60.5));
        }
    }
}
