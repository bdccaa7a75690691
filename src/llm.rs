//! Text-generation collaborator client.
//!
//! The planner, ranker and analyzer talk to a language model through the
//! [`TextGenerator`] capability. Two implementations ship with the crate:
//! - [`HttpGenerator`]: OpenAI-compatible chat completions over `curl`, with
//!   streaming and an activity timeout, falling back to a single
//!   non-streaming request
//! - [`ScriptedGenerator`]: queued canned responses for tests and offline runs
//!
//! Responses are free text. Callers pull structured data out with
//! [`extract_json`]; anything that does not parse is a collaborator failure.

use base64::Engine;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

/// Result type for collaborator calls
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors raised by text-generation collaborators
#[derive(Debug, Error)]
pub enum LlmError {
    /// The endpoint could not be reached or the request failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No data arrived for too long
    #[error("no response for {0:?}")]
    ActivityTimeout(Duration),

    /// The request as a whole ran past its ceiling
    #[error("request exceeded {0:?}")]
    RequestTimeout(Duration),

    /// The response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The collaborator has nothing to say
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One request to the collaborator
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Optional PNG attached to the prompt
    pub image: Option<Vec<u8>>,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image = Some(png);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The text-generation capability.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> LlmResult<String>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// Configuration for [`HttpGenerator`]
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name to use
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Timeout for initial connection (seconds)
    pub connection_timeout: u64,
    /// Timeout for inactivity during streaming (seconds)
    pub activity_timeout: u64,
    /// Ceiling on one whole generation, fallback included (seconds)
    pub request_timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            endpoint: cfg.llm.endpoint.clone(),
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            connection_timeout: cfg.llm.connect_timeout,
            activity_timeout: cfg.llm.activity_timeout,
            request_timeout: cfg.llm.request_timeout,
        }
    }
}

impl LlmConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn activity_timeout(mut self, seconds: u64) -> Self {
        self.activity_timeout = seconds;
        self
    }

    pub fn request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }
}

/// Check if an endpoint is reachable (connection-only check).
///
/// Any HTTP status counts as reachable; only a failed connection does not.
pub fn check_health(endpoint: &str, timeout_secs: u64) -> LlmResult<bool> {
    let url = endpoint.trim_start_matches("http://").trim_start_matches("https://");
    let host_port = url.split('/').next().unwrap_or("127.0.0.1:8080");

    let output = Command::new("curl")
        .args([
            "-s",
            "-o", "/dev/null",
            "-w", "%{http_code}",
            "--connect-timeout", &timeout_secs.to_string(),
            "--max-time", &timeout_secs.to_string(),
            "-I",
            &format!("http://{}", host_port),
        ])
        .output()?;

    let status = String::from_utf8_lossy(&output.stdout);
    // 000 means the connection failed entirely
    let code: u16 = status.trim().parse().unwrap_or(0);
    Ok(code > 0)
}

/// Chat-completions client driven through `curl`.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    config: LlmConfig,
}

impl HttpGenerator {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> LlmResult<String> {
        let content = match &request.image {
            Some(png) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(png);
                serde_json::json!([
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/png;base64,{}", encoded) }
                    },
                    { "type": "text", "text": request.prompt }
                ])
            }
            None => serde_json::Value::String(request.prompt.clone()),
        };

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": self.config.max_tokens,
            "stream": stream
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        serde_json::to_string(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }

    /// `curl` for one request that must finish by `deadline`.
    ///
    /// The cap is rounded up to whole seconds. Streaming requests get a spare
    /// second so the reader loop reports the deadline itself.
    fn curl(&self, stream: bool, deadline: Instant) -> Command {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let cap = remaining.as_secs() + if stream { 2 } else { 1 };

        let mut cmd = Command::new("curl");
        cmd.args([
            "-s",
            "-X", "POST",
            &self.config.endpoint,
            "-H", "Content-Type: application/json",
            "--data-binary", "@-",
            "--connect-timeout", &self.config.connection_timeout.to_string(),
            "--max-time", &cap.to_string(),
        ]);
        if stream {
            cmd.arg("-N");
        }
        cmd
    }

    fn generate_streaming(&self, request: &GenerationRequest, deadline: Instant) -> LlmResult<String> {
        let body = self.request_body(request, true)?;

        let mut child = self
            .curl(true, deadline)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::Io(std::io::Error::other("failed to capture stdout")))?;

        let (tx, rx) = mpsc::channel();
        let activity_timeout = Duration::from_secs(self.config.activity_timeout);

        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        });

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut last_activity = Instant::now();

        loop {
            // A server trickling data never trips the activity timeout
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LlmError::RequestTimeout(Duration::from_secs(self.config.request_timeout)));
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(line)) => {
                    last_activity = Instant::now();

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break;
                    }
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                        let delta = &json["choices"][0]["delta"];
                        if let Some(text) = delta["content"].as_str() {
                            content.push_str(text);
                        }
                        if let Some(text) = delta["reasoning_content"].as_str() {
                            reasoning.push_str(text);
                        }
                    }
                }
                Ok(Err(e)) => {
                    let _ = child.kill();
                    return Err(LlmError::Io(e));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() > activity_timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(LlmError::ActivityTimeout(activity_timeout));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        if content.is_empty() {
            content = reasoning;
        }
        if !status.success() && content.is_empty() {
            return Err(LlmError::ConnectionFailed("curl process failed".to_string()));
        }
        Ok(content)
    }

    /// Fallback for servers that ignore `stream: true`
    fn generate_blocking(&self, request: &GenerationRequest, deadline: Instant) -> LlmResult<String> {
        if Instant::now() >= deadline {
            return Err(LlmError::RequestTimeout(Duration::from_secs(self.config.request_timeout)));
        }
        let body = self.request_body(request, false)?;

        let mut child = self
            .curl(false, deadline)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(LlmError::ConnectionFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let response: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let message = &response["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or("");
        let text = if content.is_empty() {
            message["reasoning_content"].as_str().unwrap_or("")
        } else {
            content
        };

        if text.is_empty() {
            return Err(LlmError::InvalidResponse("response carried no message content".to_string()));
        }
        Ok(text.to_string())
    }
}

impl TextGenerator for HttpGenerator {
    fn generate(&self, request: &GenerationRequest) -> LlmResult<String> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.request_timeout.max(1));
        let content = self.generate_streaming(request, deadline)?;
        let text = if content.is_empty() {
            debug!("streaming produced no content, retrying without streaming");
            self.generate_blocking(request, deadline)?
        } else {
            content
        };
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, chars = text.len(), "generation complete");
        Ok(text)
    }
}

// ============================================================================
// Scripted stand-in
// ============================================================================

/// A generator that replays queued responses in order.
///
/// When the queue runs dry it answers with the default response if one was
/// set, otherwise it fails as an unavailable collaborator.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Result<String, String>>>,
    default: Option<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses to return in order
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let generator = Self::new();
        for r in responses {
            generator.push_ok(r);
        }
        generator
    }

    /// Answer every otherwise-unscripted request with `response`
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default = Some(response.into());
        self
    }

    pub fn push_ok(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Ok(response.into()));
        }
    }

    pub fn push_err(&self, message: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(message.into()));
        }
    }

    /// Prompts received so far, in order
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.iter().map(|req| req.prompt.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of received requests that carried an image
    pub fn image_requests(&self) -> usize {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|req| req.image.is_some()).count())
            .unwrap_or(0)
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> LlmResult<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::ConnectionFailed(message)),
            None => self
                .default
                .clone()
                .ok_or_else(|| LlmError::Unavailable("no scripted response left".to_string())),
        }
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Pull the JSON payload out of a free-text response.
///
/// Accepts bare JSON, JSON inside a code fence, and JSON surrounded by prose
/// or a `<think>` block.
pub fn extract_json(text: &str) -> LlmResult<serde_json::Value> {
    let text = strip_think(text);
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(Ok(value)) = fenced_block(trimmed).map(|f| serde_json::from_str(f.trim())) {
        return Ok(value);
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) else {
            continue;
        };
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    warn!(preview = %preview(trimmed), "collaborator response is not JSON");
    Err(LlmError::InvalidResponse("no JSON payload in response".to_string()))
}

fn strip_think(text: &str) -> &str {
    match text.find("</think>") {
        Some(end) => &text[end + "</think>".len()..],
        None => text,
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
