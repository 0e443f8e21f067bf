//! Streaming completion client and sentence segmentation
//!
//! Submits the conversation to the inference server, decodes its
//! server-sent-event stream incrementally, and hands speakable sentence
//! chunks to the playback worker as soon as they complete, so the character
//! starts talking before the full response exists.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::history::ConversationHistory;
use crate::protocol::EventWriter;
use crate::speech::{self, ChunkRenderer, PiperRenderer, TtsChunk};
use crate::Result;

/// Whole-request timeout; a hung upstream stalls a turn at most this long
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum trimmed buffer length before a sentence terminator ends a chunk
const MIN_CHUNK_CHARS: usize = 10;

/// One decoded event of the completion stream
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct StreamEvent {
    /// Incremental text delta
    #[serde(default)]
    pub content: String,
    /// True on the final event of a response
    #[serde(default)]
    pub stop: bool,
}

/// Streaming completion request body for `POST /completion`
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f64,
    repeat_penalty: f64,
    stream: bool,
    stop: &'a [String],
}

/// Accumulates stream deltas and cuts them into speakable chunks.
///
/// A boundary is declared when the stream signals end-of-response, or when
/// the trimmed buffer is longer than the minimum and ends in `.`, `!` or
/// `?`. Residual text at stream end is flushed by [`Self::finish`].
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buf: String,
}

impl SentenceSplitter {
    /// Empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta; returns a completed chunk if this delta closed one
    pub fn push(&mut self, delta: &str, stop: bool) -> Option<String> {
        self.buf.push_str(delta);

        let trimmed_end = self.buf.trim_end();
        let at_sentence_end = trimmed_end.chars().count() > MIN_CHUNK_CHARS
            && trimmed_end
                .chars()
                .last()
                .is_some_and(|c| matches!(c, '.' | '!' | '?'));

        if stop || at_sentence_end {
            let chunk = self.buf.trim().to_string();
            self.buf.clear();
            return (!chunk.is_empty()).then_some(chunk);
        }
        None
    }

    /// Flush any residual text as a final chunk
    pub fn finish(&mut self) -> Option<String> {
        let chunk = self.buf.trim().to_string();
        self.buf.clear();
        (!chunk.is_empty()).then_some(chunk)
    }
}

/// Decode one SSE line; anything that is not a well-formed `data: ` event is
/// skipped
#[must_use]
pub fn decode_sse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.trim().strip_prefix("data: ")?;
    serde_json::from_str(payload).ok()
}

/// Build the single-turn prompt from the persona preamble and the most
/// recent user message
#[must_use]
pub fn build_prompt(config: &Config, history: &ConversationHistory) -> String {
    let persona = &config.persona;
    let last_user = history.last_user().unwrap_or("hello");
    format!(
        "{}\n\n{}: {}\n{}:",
        persona.preamble, persona.user_label, last_user, persona.assistant_label
    )
}

/// Streaming completion client driving the playback worker
pub struct CompletionStreamer {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl CompletionStreamer {
    /// Create a streamer for the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed; a client
    /// without the request timeout could stall a turn indefinitely.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    /// Generate and speak one response.
    ///
    /// Returns the full response text; on any failure the configured
    /// fallback line is both spoken and returned, so a turn always has an
    /// audible reply and this call never errors.
    pub async fn get_response(
        &self,
        history: &ConversationHistory,
        events: &EventWriter,
    ) -> String {
        let renderer = PiperRenderer::new(
            self.config.tts.clone(),
            self.config.audio.clone(),
            events.clone(),
        );
        self.get_response_with(history, events, renderer).await
    }

    /// [`Self::get_response`] with an explicit chunk renderer.
    ///
    /// The worker is spawned before the request goes out, fed chunk by
    /// chunk, terminated with [`TtsChunk::Done`], and joined before this
    /// returns — one worker per turn, and returning means the turn is fully
    /// rendered.
    pub async fn get_response_with<R>(
        &self,
        history: &ConversationHistory,
        events: &EventWriter,
        renderer: R,
    ) -> String
    where
        R: ChunkRenderer + 'static,
    {
        let prompt = build_prompt(&self.config, history);
        let backend = &self.config.backend;
        let request = CompletionRequest {
            prompt: &prompt,
            n_predict: backend.n_predict,
            temperature: backend.temperature,
            repeat_penalty: backend.repeat_penalty,
            stream: true,
            stop: &backend.stop,
        };

        let (tx, worker) = speech::spawn_worker(events.clone(), renderer);
        let full_text = self.consume_stream(&request, &tx).await;

        let response = if full_text.trim().is_empty() {
            let fallback = self.config.persona.fallback_line.clone();
            send_chunk(&tx, TtsChunk::Text(fallback.clone())).await;
            fallback
        } else {
            full_text.trim().to_string()
        };

        send_chunk(&tx, TtsChunk::Done).await;
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "playback worker panicked");
        }

        tracing::debug!(response = %response, "completion finished");
        response
    }

    /// Issue the request and feed sentence chunks to the worker; returns the
    /// accumulated full text (possibly empty on stream abort)
    async fn consume_stream(
        &self,
        request: &CompletionRequest<'_>,
        tx: &mpsc::Sender<TtsChunk>,
    ) -> String {
        let mut splitter = SentenceSplitter::new();
        let mut full_text = String::new();

        let response = match self
            .client
            .post(self.config.completion_url())
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "completion request failed");
                return full_text;
            }
        };

        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "completion request rejected");
            return full_text;
        }

        let mut body = response.bytes_stream();
        // partial line carried across network chunks; split on \n only so
        // multi-byte characters are never cut
        let mut pending: Vec<u8> = Vec::new();

        'stream: while let Some(item) = body.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "completion stream error");
                    break;
                }
            };
            pending.extend_from_slice(&bytes);

            while let Some(line) = take_line(&mut pending) {
                let Some(event) = decode_sse_line(&line) else {
                    continue;
                };

                full_text.push_str(&event.content);
                if let Some(chunk) = splitter.push(&event.content, event.stop) {
                    send_chunk(tx, TtsChunk::Text(chunk)).await;
                }
                if event.stop {
                    break 'stream;
                }
            }
        }

        if let Some(residual) = splitter.finish() {
            send_chunk(tx, TtsChunk::Text(residual)).await;
        }

        full_text
    }
}

/// Remove and return the first complete line from the byte buffer
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let idx = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=idx).collect();
    let text = String::from_utf8_lossy(&line);
    Some(text.trim_end_matches(['\n', '\r']).to_string())
}

async fn send_chunk(tx: &mpsc::Sender<TtsChunk>, chunk: TtsChunk) {
    if tx.send(chunk).await.is_err() {
        tracing::debug!("playback worker gone, chunk dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_deltas_one_chunk() {
        // {"content":"Hello","stop":false} then {"content":" there.","stop":true}
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.push("Hello", false), None);
        assert_eq!(
            splitter.push(" there.", true),
            Some("Hello there.".to_string())
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn short_sentences_wait_for_length() {
        let mut splitter = SentenceSplitter::new();
        // ends in '.', but trimmed length is not above the minimum yet
        assert_eq!(splitter.push("Hi.", false), None);
        assert_eq!(
            splitter.push(" More words now.", false),
            Some("Hi. More words now.".to_string())
        );
    }

    #[test]
    fn boundary_on_each_terminator() {
        for terminator in [".", "!", "?"] {
            let mut splitter = SentenceSplitter::new();
            let text = format!("A full sentence{terminator}");
            assert_eq!(splitter.push(&text, false), Some(text.clone()));
        }
    }

    #[test]
    fn trailing_whitespace_does_not_hide_terminator() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(
            splitter.push("A full sentence.   ", false),
            Some("A full sentence.".to_string())
        );
    }

    #[test]
    fn residual_is_flushed() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.push("an unfinished thought", false), None);
        assert_eq!(
            splitter.finish(),
            Some("an unfinished thought".to_string())
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn stop_with_empty_buffer_yields_no_chunk() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.push("", true), None);
    }

    #[test]
    fn decodes_data_lines_only() {
        let event = decode_sse_line(r#"data: {"content":"Hi","stop":false}"#).unwrap();
        assert_eq!(event.content, "Hi");
        assert!(!event.stop);

        assert_eq!(decode_sse_line(": keep-alive"), None);
        assert_eq!(decode_sse_line(""), None);
        assert_eq!(decode_sse_line("data: not json"), None);
    }

    #[test]
    fn decode_defaults_missing_fields() {
        let event = decode_sse_line(r#"data: {"stop":true}"#).unwrap();
        assert_eq!(event.content, "");
        assert!(event.stop);

        // extra fields from newer servers are ignored
        let event =
            decode_sse_line(r#"data: {"content":"x","stop":false,"tokens_predicted":7}"#).unwrap();
        assert_eq!(event.content, "x");
    }

    #[test]
    fn take_line_handles_partial_and_crlf() {
        let mut pending = b"data: one\r\ndata: tw".to_vec();
        assert_eq!(take_line(&mut pending), Some("data: one".to_string()));
        assert_eq!(take_line(&mut pending), None);
        pending.extend_from_slice(b"o\n");
        assert_eq!(take_line(&mut pending), Some("data: two".to_string()));
    }

    #[test]
    fn prompt_shape() {
        let config = Config::default();
        let mut history = ConversationHistory::new();
        history.push_user("what is a bird");

        let prompt = build_prompt(&config, &history);
        assert!(prompt.starts_with(&config.persona.preamble));
        assert!(prompt.contains("\n\nHuman: what is a bird\n"));
        assert!(prompt.ends_with("Perch:"));
    }

    #[test]
    fn prompt_falls_back_to_hello() {
        let config = Config::default();
        let history = ConversationHistory::new();
        assert!(build_prompt(&config, &history).contains("Human: hello\n"));
    }
}
