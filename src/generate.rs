//! Text generation against an Ollama-compatible backend.
//!
//! [`GenerationClient::stream_generate`] posts to `/api/generate` with
//! `stream: true` and consumes the newline-delimited JSON response:
//!
//! ```text
//! Started ──▶ Streaming ──(done: true)──▶ Done
//!                 │
//!                 └──(transport failure)──▶ Errored
//! ```
//!
//! Each chunk may carry a `response` text fragment and a `done` flag. Lines
//! that are empty or not JSON are skipped. Progress (percent of the token
//! budget, throughput, ETA) is reported at most once per
//! `progress_interval_ms`, and always once at 100% when the stream finishes.
//! Nothing after the terminal chunk is processed.
//!
//! Token counts are an approximation: each non-empty fragment counts as its
//! whitespace-delimited word count, minimum one. The ETA is computed in the
//! same unit, so the two stay consistent even though neither matches the
//! model's tokenizer.
//!
//! A [`CancellationToken`] is checked for every network chunk; cancelling
//! drops the response stream, which closes the connection.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::progress::{GenerationProgress, ProgressEvent, ProgressReporter};

/// Elapsed-time floor used for rate and ETA math.
const MIN_ELAPSED_SECS: f64 = 0.001;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("generation stream failed: {0}")]
    Stream(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid response from generation backend: {0}")]
    InvalidResponse(String),
    #[error("generation cancelled after {tokens} tokens")]
    Cancelled { partial: String, tokens: u64 },
}

/// Final result of a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// Accumulated output, trimmed.
    pub text: String,
    /// Approximate token count, see the module docs.
    pub tokens: u64,
    pub elapsed: Duration,
    /// False when the stream ended without a terminal chunk.
    pub completed: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Approximate token count of a fragment: its whitespace-delimited word
/// count, at least 1 for any non-empty fragment.
pub fn estimate_tokens(fragment: &str) -> u64 {
    if fragment.is_empty() {
        return 0;
    }
    fragment.split_whitespace().count().max(1) as u64
}

/// State of one streaming generation.
#[derive(Debug)]
pub struct StreamMonitor {
    num_predict: u64,
    interval: Duration,
    started: Instant,
    last_emit: Instant,
    text: String,
    tokens: u64,
    done: bool,
}

impl StreamMonitor {
    pub fn new(num_predict: u64, interval: Duration, started: Instant) -> Self {
        Self {
            num_predict,
            interval,
            started,
            last_emit: started,
            text: String::new(),
            tokens: 0,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Process one response line received at `now`. Returns a progress
    /// snapshot when one is due.
    pub fn feed_line(&mut self, line: &str, now: Instant) -> Option<GenerationProgress> {
        if self.done {
            return None;
        }
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let chunk: StreamChunk = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping malformed stream line");
                return None;
            }
        };

        let fragment = chunk
            .response
            .or_else(|| chunk.message.and_then(|m| m.content));
        if let Some(fragment) = fragment {
            self.tokens += estimate_tokens(&fragment);
            self.text.push_str(&fragment);
        }

        if chunk.done {
            self.done = true;
            self.last_emit = now;
            return Some(self.progress(now));
        }

        if now.duration_since(self.last_emit) >= self.interval {
            self.last_emit = now;
            return Some(self.progress(now));
        }
        None
    }

    /// Snapshot at `now`. Percent stays below 100 until the backend has
    /// confirmed completion.
    pub fn progress(&self, now: Instant) -> GenerationProgress {
        let elapsed = now
            .duration_since(self.started)
            .as_secs_f64()
            .max(MIN_ELAPSED_SECS);
        let rate = self.tokens as f64 / elapsed;
        let remaining = self.num_predict.saturating_sub(self.tokens);
        let eta_secs = (remaining as f64 / rate.max(MIN_ELAPSED_SECS)).floor() as u64;

        let percent = if self.done {
            100
        } else {
            (self.tokens * 100 / self.num_predict.max(1)).min(99) as u8
        };

        GenerationProgress {
            percent,
            tokens: self.tokens,
            rate,
            eta_secs,
            done: self.done,
        }
    }

    /// Close out the stream at `now`, forcing the final progress to 100%.
    fn finish(mut self, now: Instant, reporter: &dyn ProgressReporter) -> Generated {
        let completed = self.done;
        if !completed {
            warn!(
                tokens = self.tokens,
                "stream ended without a terminal chunk"
            );
            self.done = true;
            reporter.report(ProgressEvent::Generating(self.progress(now)));
        }
        Generated {
            text: self.text.trim().to_string(),
            tokens: self.tokens,
            elapsed: now.duration_since(self.started),
            completed,
        }
    }

    fn cancelled(&self) -> GenerateError {
        GenerateError::Cancelled {
            partial: self.text.trim().to_string(),
            tokens: self.tokens,
        }
    }
}

/// Drive `monitor` over a chunked byte stream until the terminal chunk, the
/// end of the stream, or cancellation.
pub async fn consume_stream<S, B, E>(
    stream: S,
    mut monitor: StreamMonitor,
    reporter: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<Generated, GenerateError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut stream = std::pin::pin!(stream);
    let mut buf: Vec<u8> = Vec::new();

    while !monitor.is_done() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(monitor.cancelled()),
            item = stream.next() => item,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(GenerateError::Stream(Box::new(e))),
            None => break,
        };
        buf.extend_from_slice(bytes.as_ref());

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(p) = monitor.feed_line(&line, Instant::now()) {
                reporter.report(ProgressEvent::Generating(p));
            }
            if monitor.is_done() {
                break;
            }
        }
    }

    // trailing line without a newline
    if !monitor.is_done() && !buf.is_empty() {
        let line = String::from_utf8_lossy(&buf);
        if let Some(p) = monitor.feed_line(&line, Instant::now()) {
            reporter.report(ProgressEvent::Generating(p));
        }
    }

    Ok(monitor.finish(Instant::now(), reporter))
}

/// Client for an Ollama-compatible generation backend.
pub struct GenerationClient {
    client: reqwest::Client,
    host: String,
    model: String,
    num_predict: u64,
    interval: Duration,
}

impl GenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerateError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            client: builder.build()?,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            num_predict: config.num_predict,
            interval: Duration::from_millis(config.progress_interval_ms),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Stream a completion for `prompt`, reporting progress as it arrives.
    pub async fn stream_generate(
        &self,
        prompt: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Generated, GenerateError> {
        info!(model = %self.model, num_predict = self.num_predict, "starting generation");
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": { "num_predict": self.num_predict },
        });

        let started = Instant::now();
        let request = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&payload)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(GenerateError::Cancelled { partial: String::new(), tokens: 0 });
            }
            resp = request => resp?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Status { status, body });
        }

        let monitor = StreamMonitor::new(self.num_predict, self.interval, started);
        let generated = consume_stream(response.bytes_stream(), monitor, reporter, cancel).await?;

        info!(
            tokens = generated.tokens,
            elapsed_ms = generated.elapsed.as_millis() as u64,
            "generation complete"
        );
        Ok(generated)
    }

    /// Single-shot, non-streaming chat completion via `/api/chat`.
    pub async fn complete(&self, prompt: &str) -> Result<String, GenerateError> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
            "options": { "num_predict": self.num_predict },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Status { status, body });
        }

        let chunk: StreamChunk = response.json().await?;
        let content = chunk.message.and_then(|m| m.content);
        let text = match (content, chunk.response) {
            (Some(c), _) if !c.is_empty() => c,
            (_, Some(r)) => r,
            (Some(c), None) => c,
            (None, None) => {
                return Err(GenerateError::InvalidResponse(
                    "neither message.content nor response present".to_string(),
                ))
            }
        };
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<GenerationProgress>>,
    }

    impl ProgressReporter for Recorder {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Generating(p) = event {
                self.events.lock().unwrap().push(p);
            }
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<GenerationProgress> {
            self.events.lock().unwrap().clone()
        }
    }

    type Chunk = Result<Vec<u8>, std::io::Error>;

    fn chunks(parts: &[&str]) -> Vec<Chunk> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    fn monitor(num_predict: u64) -> StreamMonitor {
        StreamMonitor::new(num_predict, Duration::from_millis(100), Instant::now())
    }

    fn config(host: &str) -> GenerationConfig {
        GenerationConfig {
            host: host.to_string(),
            model: "test-model".to_string(),
            num_predict: 10,
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens(" "), 1);
        assert_eq!(estimate_tokens("Hello"), 1);
        assert_eq!(estimate_tokens(" two words\n"), 2);
    }

    #[test]
    fn test_progress_is_throttled() {
        let start = Instant::now();
        let mut m = StreamMonitor::new(100, Duration::from_millis(100), start);

        assert!(m
            .feed_line(r#"{"response":"a b"}"#, start + Duration::from_millis(10))
            .is_none());
        let p = m
            .feed_line(r#"{"response":" c"}"#, start + Duration::from_millis(120))
            .unwrap();
        assert_eq!(p.tokens, 3);
        assert_eq!(p.percent, 3);
        assert!(!p.done);
        assert!(m
            .feed_line(r#"{"response":" d"}"#, start + Duration::from_millis(150))
            .is_none());
        assert!(m
            .feed_line(r#"{"response":" e"}"#, start + Duration::from_millis(220))
            .is_some());
    }

    #[test]
    fn test_percent_capped_until_done() {
        let start = Instant::now();
        let mut m = StreamMonitor::new(2, Duration::from_millis(100), start);
        let p = m
            .feed_line(
                r#"{"response":"one two three four"}"#,
                start + Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(p.percent, 99);
        assert_eq!(p.eta_secs, 0);

        let p = m
            .feed_line(r#"{"done":true}"#, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(p.percent, 100);
        assert!(p.done);
    }

    #[test]
    fn test_rate_and_eta() {
        let start = Instant::now();
        let mut m = StreamMonitor::new(100, Duration::from_millis(100), start);
        let p = m
            .feed_line(
                r#"{"response":"w w w w w w w w w w"}"#,
                start + Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(p.tokens, 10);
        assert!((p.rate - 5.0).abs() < 1e-9);
        assert_eq!(p.eta_secs, 18);
    }

    #[test]
    fn test_zero_elapsed_does_not_divide_by_zero() {
        let start = Instant::now();
        let mut m = StreamMonitor::new(10, Duration::ZERO, start);
        let p = m.feed_line(r#"{"response":"hi"}"#, start).unwrap();
        assert!(p.rate.is_finite());
        assert!(p.rate > 0.0);
    }

    #[test]
    fn test_malformed_and_empty_lines_are_skipped() {
        let mut m = monitor(10);
        let now = Instant::now();
        assert!(m.feed_line("", now).is_none());
        assert!(m.feed_line("{not json", now).is_none());
        assert!(m.feed_line("42", now).is_none());
        m.feed_line(r#"{"response":"ok"}"#, now);
        assert_eq!(m.text(), "ok");
        assert_eq!(m.tokens(), 1);
    }

    #[test]
    fn test_lines_after_done_are_ignored() {
        let mut m = monitor(10);
        let now = Instant::now();
        m.feed_line(r#"{"response":"a","done":true}"#, now);
        assert!(m.is_done());
        assert!(m.feed_line(r#"{"response":"late"}"#, now).is_none());
        assert_eq!(m.text(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_terminates_on_done() {
        let recorder = Recorder::default();
        let stream = futures::stream::iter(chunks(&[
            "{\"response\":\" Hello\"}\n{\"resp",
            "onse\":\" world \",\"done\":false}\n\ngarbage\n",
            "{\"done\":true}\n{\"response\":\"IGNORED\"}\n",
        ]));

        let out = consume_stream(stream, monitor(300), &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.text, "Hello world");
        assert_eq!(out.tokens, 2);
        assert!(out.completed);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 100);
        assert!(events[0].done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_eof_without_done() {
        let recorder = Recorder::default();
        let stream = futures::stream::iter(chunks(&["{\"response\":\"partial\"}"]));

        let out = consume_stream(stream, monitor(10), &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.text, "partial");
        assert!(!out.completed);
        let events = recorder.events();
        assert_eq!(events.last().map(|p| p.percent), Some(100));
    }

    #[tokio::test]
    async fn test_stream_error_is_fatal() {
        let recorder = Recorder::default();
        let stream = futures::stream::iter(vec![
            Ok(b"{\"response\":\"a\"}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let err = consume_stream(stream, monitor(10), &recorder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Stream(_)));
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() {
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(chunks(&["{\"response\":\"so far\"}\n"]))
            .chain(futures::stream::pending());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = consume_stream(stream, monitor(10), &recorder, &cancel)
            .await
            .unwrap_err();
        match err {
            GenerateError::Cancelled { partial, tokens } => {
                assert_eq!(partial, "so far");
                assert_eq!(tokens, 2);
            }
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_generate_against_backend() {
        let server = MockServer::start().await;
        let body = [
            r#"{"model":"test-model","response":"The","done":false}"#,
            r#"{"model":"test-model","response":" answer","done":false}"#,
            r#"{"model":"test-model","response":" is 42.","done":false}"#,
            r#"{"model":"test-model","response":"","done":true,"eval_count":5}"#,
        ]
        .join("\n")
            + "\n";
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "stream": true,
                "options": {"num_predict": 10}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let client = GenerationClient::new(&config(&server.uri())).unwrap();
        let recorder = Recorder::default();
        let out = client
            .stream_generate("question?", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.text, "The answer is 42.");
        assert_eq!(out.tokens, 4);
        assert!(out.completed);
        assert_eq!(recorder.events().last().unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_error_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GenerationClient::new(&config(&server.uri())).unwrap();
        let err = client
            .stream_generate("q", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenerateError::Status { status, body } => {
                assert_eq!(status.as_u16(), 404);
                assert_eq!(body, "model not found");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        // port 9 (discard) is essentially never served locally
        let client = GenerationClient::new(&config("http://127.0.0.1:9")).unwrap();
        let err = client
            .stream_generate("q", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Transport(_)));
    }

    #[tokio::test]
    async fn test_complete_reads_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "  hi there \n"},
                "done": true
            })))
            .mount(&server)
            .await;

        let client = GenerationClient::new(&config(&server.uri())).unwrap();
        assert_eq!(client.complete("hello").await.unwrap(), "hi there");
    }

    #[tokio::test]
    async fn test_complete_falls_back_to_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "fallback",
                "done": true
            })))
            .mount(&server)
            .await;

        let client = GenerationClient::new(&config(&server.uri())).unwrap();
        assert_eq!(client.complete("hello").await.unwrap(), "fallback");
    }
}
