//! Transformation client: send (instruction, page text) to a chat model.
//!
//! This module turns one page of text into transformed content. It is split
//! in two layers:
//!
//! * [`CompletionBackend`] — one HTTP round-trip, classified into a
//!   [`BackendError`]. [`OpenAiCompatBackend`] speaks the OpenAI
//!   chat-completions protocol, which most gateways and local servers accept.
//! * [`Transformer`] — the retry loop, usage accounting and output cleanup
//!   on top of any backend.
//!
//! ## Retry Strategy
//!
//! Timeouts and connection failures are transient: they are retried up to
//! `max_attempts` total attempts with the policy's delay between them, then
//! surfaced as [`TransformError::Timeout`]. Everything else (4xx/5xx,
//! error bodies, undecodable responses) is a provider answer and retrying it
//! would only burn quota, so it is surfaced at once as
//! [`TransformError::Provider`].
//!
//! ## Response shape
//!
//! The one accepted shape is `choices[0].message.content` with an optional
//! `usage` object. A body carrying an `error` member is a provider error even
//! under HTTP 200.

use crate::error::{EngineError, TransformError};
use crate::pipeline::postprocess;
use crate::pipeline::retry::RetryPolicy;
use crate::usage::UsageCounter;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Fixed generation parameters applied to every request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub params: GenerationParams,
    /// Sent as the system message.
    pub instruction: String,
    /// Sent as the user message.
    pub text: String,
}

/// Normalised provider answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    /// `None` when the provider did not report usage.
    pub usage: Option<TokenUsage>,
}

/// Outcome of a single backend round-trip.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Provider(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Timeouts and connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Connection(_))
    }

    fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn provider_message(&self) -> String {
        match self {
            BackendError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A chat-completion endpoint.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, BackendError>;
}

// ── OpenAI-compatible HTTP backend ───────────────────────────────────────

/// Backend for any server implementing `POST {base}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiCompatBackend {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let mut payload = json!({
            "model": request.params.model,
            "messages": [
                { "role": "system", "content": request.instruction },
                { "role": "user", "content": request.text },
            ],
            "temperature": request.params.temperature,
            "top_p": 1,
            "presence_penalty": 0,
            "frequency_penalty": 0,
        });
        if let Some(max_tokens) = request.params.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let mut builder = self.http.post(&self.endpoint).json(&payload);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;

        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(BackendError::Timeout(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: error_message_from_body(&body),
            });
        }
        parse_completion(&body)
    }
}

fn classify_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else if e.is_decode() {
        BackendError::Malformed(e.to_string())
    } else {
        BackendError::Connection(e.to_string())
    }
}

#[derive(Deserialize)]
struct ChatCompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Normalise a chat-completions body into a [`CompletionResponse`].
pub fn parse_completion(body: &str) -> Result<CompletionResponse, BackendError> {
    let parsed: ChatCompletionBody =
        serde_json::from_str(body).map_err(|e| BackendError::Malformed(e.to_string()))?;

    if let Some(err) = parsed.error {
        return Err(BackendError::Provider(error_message(&err)));
    }

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Malformed("no choices[0].message.content".into()))?;

    Ok(CompletionResponse {
        content,
        usage: parsed.usage,
    })
}

fn error_message(err: &Value) -> String {
    err.get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_message))
        .unwrap_or_else(|| body.trim().chars().take(500).collect())
}

// ── Transformer ──────────────────────────────────────────────────────────

/// A successful transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformation {
    pub content: String,
    pub usage: TokenUsage,
    /// True when `usage.total_tokens` is an estimate from the input length.
    pub usage_estimated: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Rough token estimate used when the provider omits usage: one token per
/// four bytes of input.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Drives a [`CompletionBackend`] with retry, usage accounting and cleanup.
#[derive(Clone)]
pub struct Transformer {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
    usage: Arc<UsageCounter>,
    params: GenerationParams,
    clean_output: bool,
}

impl Transformer {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        retry: RetryPolicy,
        usage: Arc<UsageCounter>,
        params: GenerationParams,
    ) -> Self {
        Self {
            backend,
            retry,
            usage,
            params,
            clean_output: true,
        }
    }

    pub fn with_clean_output(mut self, v: bool) -> Self {
        self.clean_output = v;
        self
    }

    pub fn usage(&self) -> &Arc<UsageCounter> {
        &self.usage
    }

    /// Transform `text` under `instruction`.
    ///
    /// On success the shared usage counter is charged with the reported total,
    /// or with [`estimate_tokens`] when the provider reports none.
    pub async fn transform(
        &self,
        text: &str,
        instruction: &str,
    ) -> Result<Transformation, TransformError> {
        let start = Instant::now();
        let request = CompletionRequest {
            params: self.params.clone(),
            instruction: instruction.to_string(),
            text: text.to_string(),
        };
        let max_attempts = self.retry.max_attempts();
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                warn!(
                    "Retry {}/{} after transient failure: {}",
                    attempt - 1,
                    max_attempts - 1,
                    last_err
                );
                self.retry.pause(attempt - 1).await;
            }

            match self.backend.complete(&request).await {
                Ok(response) => {
                    let (usage, usage_estimated) = resolve_usage(response.usage, text);
                    let remaining = self.usage.consume(usage.total_tokens);
                    debug!(
                        "Transformed {} chars: {} prompt / {} completion / {} total tokens{} ({} remaining), {:?}",
                        text.len(),
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.total_tokens,
                        if usage_estimated { " (estimated)" } else { "" },
                        remaining,
                        start.elapsed()
                    );

                    let content = if self.clean_output {
                        postprocess::clean_markdown(&response.content)
                    } else {
                        response.content
                    };
                    return Ok(Transformation {
                        content,
                        usage,
                        usage_estimated,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
                    last_err = e.to_string();
                }
                Err(e) => {
                    warn!("Provider rejected the request: {}", e);
                    return Err(TransformError::Provider {
                        status: e.status(),
                        message: e.provider_message(),
                    });
                }
            }
        }

        Err(TransformError::Timeout {
            attempts: max_attempts,
            detail: last_err,
        })
    }
}

/// Reported usage when it carries a total, otherwise an estimate.
fn resolve_usage(reported: Option<TokenUsage>, text: &str) -> (TokenUsage, bool) {
    match reported {
        Some(usage) if usage.total_tokens > 0 => (usage, false),
        other => {
            let mut usage = other.unwrap_or_default();
            usage.total_tokens = estimate_tokens(text);
            (usage, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::retry::{Backoff, Sleeper};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<Result<CompletionResponse, BackendError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<CompletionResponse, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Timeout("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct CountingSleeper(AtomicU32);

    #[async_trait]
    impl Sleeper for CountingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            model: "test-model".into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    fn transformer(
        backend: Arc<Scripted>,
        sleeper: Arc<CountingSleeper>,
        usage: Arc<UsageCounter>,
    ) -> Transformer {
        let retry =
            RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(1))).with_sleeper(sleeper);
        Transformer::new(backend, retry, usage, params()).with_clean_output(false)
    }

    fn ok(content: &str, total: Option<u64>) -> Result<CompletionResponse, BackendError> {
        Ok(CompletionResponse {
            content: content.into(),
            usage: total.map(|t| TokenUsage {
                prompt_tokens: t / 2,
                completion_tokens: t - t / 2,
                total_tokens: t,
            }),
        })
    }

    #[test]
    fn parse_canonical_shape() {
        let body = r##"{"choices":[{"message":{"role":"assistant","content":"# Notes"}}],
                       "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"##;
        let parsed = parse_completion(body).unwrap();
        assert_eq!(parsed.content, "# Notes");
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parse_without_usage() {
        let body = r#"{"choices":[{"message":{"content":"x"}}]}"#;
        assert_eq!(parse_completion(body).unwrap().usage, None);
    }

    #[test]
    fn parse_error_member_is_provider_error() {
        let body = r#"{"error":{"message":"insufficient quota","type":"billing"}}"#;
        assert_eq!(
            parse_completion(body),
            Err(BackendError::Provider("insufficient quota".into()))
        );
        let body = r#"{"error":"bad key"}"#;
        assert_eq!(
            parse_completion(body),
            Err(BackendError::Provider("bad key".into()))
        );
    }

    #[test]
    fn parse_missing_content_is_malformed() {
        assert!(matches!(
            parse_completion(r#"{"choices":[]}"#),
            Err(BackendError::Malformed(_))
        ));
        assert!(matches!(
            parse_completion("<html>"),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn error_message_from_non_json_body_is_truncated_text() {
        let long = "x".repeat(2_000);
        assert_eq!(error_message_from_body(&long).len(), 500);
        assert_eq!(
            error_message_from_body(r#"{"error":{"message":"nope"}}"#),
            "nope"
        );
    }

    #[test]
    fn estimate_is_quarter_of_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcdefghi"), 2);
    }

    #[tokio::test]
    async fn reported_usage_is_charged_exactly() {
        let backend = Scripted::new(vec![ok("done", Some(42))]);
        let usage = Arc::new(UsageCounter::new(1_000));
        let t = transformer(backend, Arc::default(), usage.clone());

        let out = t.transform("page text", "summarise").await.unwrap();
        assert_eq!(out.usage.total_tokens, 42);
        assert!(!out.usage_estimated);
        assert_eq!(usage.remaining(), 958);
    }

    #[tokio::test]
    async fn missing_usage_is_estimated() {
        let backend = Scripted::new(vec![ok("done", None)]);
        let usage = Arc::new(UsageCounter::new(1_000));
        let t = transformer(backend, Arc::default(), usage.clone());

        let text = "a".repeat(41);
        let out = t.transform(&text, "summarise").await.unwrap();
        assert!(out.usage_estimated);
        assert_eq!(out.usage.total_tokens, 10);
        assert_eq!(usage.remaining(), 990);
    }

    #[tokio::test]
    async fn timeouts_are_retried_then_succeed() {
        let backend = Scripted::new(vec![
            Err(BackendError::Timeout("slow".into())),
            Err(BackendError::Connection("refused".into())),
            ok("third time", Some(3)),
        ]);
        let sleeper = Arc::new(CountingSleeper::default());
        let t = transformer(backend.clone(), sleeper.clone(), Arc::new(UsageCounter::new(100)));

        let out = t.transform("x", "y").await.unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_surfaces_after_exactly_max_attempts() {
        let backend = Scripted::new(vec![]);
        let sleeper = Arc::new(CountingSleeper::default());
        let usage = Arc::new(UsageCounter::new(100));
        let t = transformer(backend.clone(), sleeper.clone(), usage.clone());

        let err = t.transform("x", "y").await.unwrap_err();
        assert!(matches!(err, TransformError::Timeout { attempts: 5, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert_eq!(sleeper.0.load(Ordering::SeqCst), 4);
        assert_eq!(usage.remaining(), 100);
    }

    #[tokio::test]
    async fn provider_error_is_not_retried() {
        let backend = Scripted::new(vec![Err(BackendError::Status {
            status: 401,
            message: "invalid api key".into(),
        })]);
        let sleeper = Arc::new(CountingSleeper::default());
        let t = transformer(backend.clone(), sleeper.clone(), Arc::new(UsageCounter::new(100)));

        let err = t.transform("x", "y").await.unwrap_err();
        assert_eq!(
            err,
            TransformError::Provider {
                status: Some(401),
                message: "invalid api key".into()
            }
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn output_is_cleaned_when_enabled() {
        let backend = Scripted::new(vec![ok("```markdown\n# Title\n```", Some(1))]);
        let retry = RetryPolicy::new(1, Backoff::Fixed(Duration::ZERO));
        let t = Transformer::new(backend, retry, Arc::new(UsageCounter::new(10)), params());
        let out = t.transform("x", "y").await.unwrap();
        assert_eq!(out.content, "# Title\n");
    }

    // ── OpenAI-compatible backend over a local socket ───────────────────

    /// Answer one request on a local port with `status` and `body`.
    /// Returns the base URL and a handle yielding the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, handle)
    }

    /// Headers received and the declared body fully read.
    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            params: params(),
            instruction: "Summarise.".into(),
            text: "page text".into(),
        }
    }

    fn http_backend(base: &str, timeout: Duration) -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(base, Some("sk-test".into()), timeout).unwrap()
    }

    #[tokio::test]
    async fn http_success_is_parsed_and_request_is_well_formed() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":"done"}}],"usage":{"total_tokens":7}}"#,
        )
        .await;
        let backend = http_backend(&base, Duration::from_secs(5));

        let response = backend.complete(&request()).await.unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.usage.unwrap().total_tokens, 7);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions"), "got: {raw}");
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw.contains(r#""role":"system""#));
        assert!(raw.contains(r#""content":"Summarise.""#));
        assert!(raw.contains(r#""content":"page text""#));
    }

    #[tokio::test]
    async fn http_gateway_timeouts_are_retryable() {
        for status in ["504 Gateway Timeout", "408 Request Timeout"] {
            let (base, _server) = serve_once(status, "{}").await;
            let err = http_backend(&base, Duration::from_secs(5))
                .complete(&request())
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::Timeout(_)), "{status}: {err:?}");
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn http_error_status_is_not_retryable() {
        let (base, _server) =
            serve_once("500 Internal Server Error", r#"{"error":{"message":"boom"}}"#).await;
        let err = http_backend(&base, Duration::from_secs(5))
            .complete(&request())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Status {
                status: 500,
                message: "boom".into()
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn http_error_body_under_200_is_provider_error() {
        let (base, _server) =
            serve_once("200 OK", r#"{"error":{"message":"insufficient quota"}}"#).await;
        let err = http_backend(&base, Duration::from_secs(5))
            .complete(&request())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Provider("insufficient quota".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        drop(listener);

        let err = http_backend(&base, Duration::from_secs(5))
            .complete(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Connection(_)), "got: {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = http_backend(&base, Duration::from_millis(200))
            .complete(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)), "got: {err:?}");
    }
}
