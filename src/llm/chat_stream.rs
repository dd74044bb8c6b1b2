//! Incremental chat completions.
//!
//! Ollama streams newline-delimited JSON objects; OpenAI-compatible servers
//! stream server-sent events whose `data:` payloads are JSON deltas. Both are
//! line oriented, so one byte-to-line splitter feeds a per-format parser.

use anyhow::{Context, Result};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::llm::TextStream;
use crate::models::ChatMessage;

/// Upper bound on one streamed generation, connection included.
const STREAM_TIMEOUT_SECS: u64 = 300;

/// Open a streaming chat completion and yield its content deltas.
///
/// Dropping the returned stream drops the HTTP response, which closes the
/// connection and stops generation server-side.
pub async fn stream_chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<TextStream> {
    let format = WireFormat::for_provider(&config.provider)?;

    let mut request = client
        .post(format.url(&config.base_url))
        .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
        .json(&format.request_body(&config.chat_model, messages));
    if format == WireFormat::OpenAiSse {
        let api_key = config.api_key.as_deref().unwrap_or_default();
        request = request.bearer_auth(api_key);
    }

    let resp = request
        .send()
        .await
        .with_context(|| format!("Failed to open {} chat stream", config.provider))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} chat stream returned {status}: {body}", config.provider);
    }

    let deltas = lines(resp.bytes_stream()).filter_map(move |line| async move {
        match line {
            Ok(line) => format.parse_line(&line),
            Err(e) => Some(Err(e)),
        }
    });
    Ok(Box::pin(deltas))
}

/// Streaming dialect spoken by the configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    OllamaNdjson,
    OpenAiSse,
}

impl WireFormat {
    fn for_provider(provider: &str) -> Result<Self> {
        match provider {
            "ollama" => Ok(Self::OllamaNdjson),
            "openai" => Ok(Self::OpenAiSse),
            other => anyhow::bail!("Unsupported LLM provider for streaming: {other}"),
        }
    }

    fn url(self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::OllamaNdjson => format!("{base}/api/chat"),
            Self::OpenAiSse => format!("{base}/v1/chat/completions"),
        }
    }

    fn request_body(self, model: &str, messages: Vec<ChatMessage>) -> StreamRequest {
        let (options, temperature) = match self {
            Self::OllamaNdjson => (Some(SamplingOptions { temperature: 0.0 }), None),
            Self::OpenAiSse => (None, Some(0.0)),
        };
        StreamRequest {
            model: model.to_string(),
            messages,
            stream: true,
            options,
            temperature,
        }
    }

    /// `Some(Ok(delta))` for text, `Some(Err(_))` for a malformed or error
    /// line, `None` for lines that carry no text (keep-alives, role-only
    /// deltas, end markers).
    fn parse_line(self, line: &str) -> Option<Result<String>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self {
            Self::OllamaNdjson => parse_ndjson_delta(line),
            Self::OpenAiSse => parse_sse_delta(line),
        }
    }
}

#[derive(Serialize)]
struct StreamRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<SamplingOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct NdjsonLine {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

fn parse_ndjson_delta(line: &str) -> Option<Result<String>> {
    let parsed: NdjsonLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => return Some(Err(anyhow::anyhow!("Malformed Ollama stream line: {e}"))),
    };
    if let Some(error) = parsed.error {
        return Some(Err(anyhow::anyhow!("Ollama stream error: {error}")));
    }
    if parsed.done {
        return None;
    }
    parsed
        .message
        .map(|m| m.content)
        .filter(|c| !c.is_empty())
        .map(Ok)
}

#[derive(Deserialize)]
struct SseDelta {
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    delta: SseDeltaBody,
}

#[derive(Deserialize)]
struct SseDeltaBody {
    content: Option<String>,
}

fn parse_sse_delta(line: &str) -> Option<Result<String>> {
    // `event:`, `id:` and comment lines carry nothing for us
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<SseDelta>(data) {
        Ok(delta) => delta
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(Ok),
        Err(e) => Some(Err(anyhow::anyhow!("Malformed OpenAI stream event: {e}"))),
    }
}

/// Split a byte stream into lines.
///
/// Bytes are buffered until a newline arrives, so a multi-byte character
/// split across network reads decodes intact. A final unterminated line is
/// still emitted when the stream ends.
fn lines(
    bytes: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut pending, mut ended)| async move {
            loop {
                if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..pos]).into_owned();
                    return Some((Ok(line), (bytes, pending, ended)));
                }
                if ended {
                    if pending.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&std::mem::take(&mut pending)).into_owned();
                    return Some((Ok(line), (bytes, pending, ended)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        ended = true;
                        pending.clear();
                        return Some((
                            Err(anyhow::anyhow!("Chat stream read failed: {e}")),
                            (bytes, pending, ended),
                        ));
                    }
                    None => ended = true,
                }
            }
        },
    )
}
