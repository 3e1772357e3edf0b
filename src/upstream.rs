use crate::str_utils;
use crate::types::{HeliographError, Result, UpstreamDelta};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Terminator sentinel sent by the provider as the final data record.
pub const STREAM_END_SENTINEL: &str = "[DONE]";

const MAX_LINE_BYTES: usize = 1024 * 1024;
const MAX_STREAM_LINES: usize = 100_000;

/// --- PROVIDER REQUEST ---

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

impl ProviderConfig {
    /// Reads `UPSTREAM_API_URL`, `UPSTREAM_API_KEY` and `UPSTREAM_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_url = require_env("UPSTREAM_API_URL")?;
        let api_key = require_env("UPSTREAM_API_KEY")?;
        let model = require_env("UPSTREAM_MODEL")?;
        Ok(Self {
            api_url,
            api_key,
            model,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(HeliographError::InvalidRequest(format!(
            "environment variable {} is missing or empty",
            name
        ))
        .into()),
    }
}

#[derive(Serialize, Debug)]
struct ProviderRequest<'a> {
    model: &'a str,
    messages: Vec<ProviderMessage<'a>>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct ProviderMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Opens a streaming completion request carrying the single user message.
/// The provider call is stateless per turn: no prior history is sent.
pub async fn open_stream(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    user_text: &str,
) -> Result<reqwest::Response> {
    let request = ProviderRequest {
        model: &provider.model,
        messages: vec![ProviderMessage {
            role: "user",
            content: user_text,
        }],
        stream: true,
    };

    let response = client
        .post(&provider.api_url)
        .header("Authorization", format!("Bearer {}", provider.api_key))
        .header("Accept", "text/event-stream")
        .json(&request)
        .send()
        .await
        .map_err(HeliographError::Network)?;

    let status = response.status();
    if !status.is_success() {
        let error_body = match response.text().await {
            Ok(text) => text,
            Err(_) => "Unknown error (failed to read response text)".to_string(),
        };
        tracing::error!("[☁️  -> ⚙️ ] Upstream Error {}: {}", status, error_body);
        return Err(HeliographError::Upstream(status, error_body).into());
    }

    Ok(response)
}

/// --- STREAM PARSER ---

/// Pull-based decoder for the provider's SSE byte stream.
///
/// Frames the raw bytes into lines (buffering records split across network
/// reads), strips the `data: ` prefix, and turns each payload into zero or
/// more [`UpstreamDelta`] values. A single record may yield a reasoning delta
/// and an answer delta, in that order. The sequence is finite and not
/// restartable: the `[DONE]` sentinel, a transport error, or upstream EOF all
/// end it.
pub struct DeltaStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    lines: FramedRead<StreamReader<S, Bytes>, LinesCodec>,
    pending: VecDeque<UpstreamDelta>,
    finished: bool,
    line_count: usize,
}

impl<S> DeltaStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    pub fn new(byte_stream: S) -> Self {
        Self {
            lines: FramedRead::new(
                StreamReader::new(byte_stream),
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            ),
            pending: VecDeque::new(),
            finished: false,
            line_count: 0,
        }
    }

    pub async fn next_delta(&mut self) -> Option<UpstreamDelta> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Some(delta);
            }
            if self.finished {
                return None;
            }

            match self.lines.next().await {
                Some(Ok(line)) => {
                    self.line_count += 1;
                    if self.line_count > MAX_STREAM_LINES {
                        tracing::error!(
                            "[☁️  -> ⚙️ ] Stream exceeded max line limit ({})",
                            MAX_STREAM_LINES
                        );
                        self.finished = true;
                        return None;
                    }

                    // Blank separator lines and `:` comments carry no data.
                    let data = match line.strip_prefix("data: ") {
                        Some(d) => d.trim(),
                        None => continue,
                    };

                    if data == STREAM_END_SENTINEL {
                        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                        self.finished = true;
                        return None;
                    }

                    self.pending.extend(parse_data_record(data));
                }
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", e);
                    self.finished = true;
                    return None;
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

/// Turns the byte stream of an accepted provider response into a delta stream.
pub fn deltas_from_response(
    response: reqwest::Response,
) -> DeltaStream<impl Stream<Item = std::io::Result<Bytes>> + Unpin> {
    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    DeltaStream::new(bytes_stream)
}

/// --- PROVIDER WIRE TYPES ---

#[derive(Deserialize, Debug, Default)]
struct ProviderChunk {
    #[serde(default)]
    choices: Vec<ProviderChoice>,
}

#[derive(Deserialize, Debug, Default)]
struct ProviderChoice {
    #[serde(default)]
    delta: ProviderChunkDelta,
}

#[derive(Deserialize, Debug, Default)]
struct ProviderChunkDelta {
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Malformed payloads are skipped with a warning; they never terminate the
/// sequence.
fn parse_data_record(data: &str) -> Vec<UpstreamDelta> {
    let chunk: ProviderChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Skipping malformed stream record: {} (payload: {})",
                e,
                str_utils::prefix_chars(data, 200)
            );
            return Vec::new();
        }
    };

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(reasoning) = choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                deltas.push(UpstreamDelta::ReasoningChunk(reasoning));
            }
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                deltas.push(UpstreamDelta::AnswerChunk(content));
            }
        }
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&[u8]>) -> Vec<UpstreamDelta> {
        let owned: Vec<std::io::Result<Bytes>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut stream = DeltaStream::new(tokio_stream::iter(owned));
        let mut deltas = Vec::new();
        while let Some(delta) = stream.next_delta().await {
            deltas.push(delta);
        }
        deltas
    }

    const FEED: &[u8] = b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"a\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"b\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n\
data: [DONE]\n\n";

    #[tokio::test]
    async fn test_reasoning_then_answer_sequence() {
        let deltas = collect(vec![FEED]).await;
        assert_eq!(
            deltas,
            vec![
                UpstreamDelta::ReasoningChunk("a".into()),
                UpstreamDelta::ReasoningChunk("b".into()),
                UpstreamDelta::AnswerChunk("x".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_split_record_matches_whole_delivery() {
        let whole = collect(vec![FEED]).await;
        for split in 1..FEED.len() {
            let parts = vec![&FEED[..split], &FEED[split..]];
            let deltas = collect(parts).await;
            assert_eq!(deltas, whole, "split at byte {}", split);
        }
    }

    #[tokio::test]
    async fn test_single_record_yields_reasoning_before_answer() {
        let feed: &[u8] =
            b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"r\",\"content\":\"c\"}}]}\n\ndata: [DONE]\n\n";
        let deltas = collect(vec![feed]).await;
        assert_eq!(
            deltas,
            vec![
                UpstreamDelta::ReasoningChunk("r".into()),
                UpstreamDelta::AnswerChunk("c".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let feed: &[u8] = b"data: {not json\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n\
data: [DONE]\n\n";
        let deltas = collect(vec![feed]).await;
        assert_eq!(deltas, vec![UpstreamDelta::AnswerChunk("ok".into())]);
    }

    #[tokio::test]
    async fn test_empty_fields_emit_nothing() {
        let feed: &[u8] = b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"\",\"content\":\"\"}}]}\n\ndata: [DONE]\n\n";
        let deltas = collect(vec![feed]).await;
        assert!(deltas.is_empty());
    }

    #[tokio::test]
    async fn test_comments_and_blank_lines_are_ignored() {
        let feed: &[u8] = b":\n\n: keepalive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n";
        let deltas = collect(vec![feed]).await;
        assert_eq!(deltas, vec![UpstreamDelta::AnswerChunk("x".into())]);
    }

    #[tokio::test]
    async fn test_eof_without_sentinel_ends_sequence() {
        let feed: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n";
        let deltas = collect(vec![feed]).await;
        assert_eq!(deltas, vec![UpstreamDelta::AnswerChunk("x".into())]);
    }

    #[tokio::test]
    async fn test_nothing_after_sentinel_is_produced() {
        let feed: &[u8] = b"data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n";
        let deltas = collect(vec![feed]).await;
        assert!(deltas.is_empty());
    }
}
