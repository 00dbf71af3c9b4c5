use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::{stream, stream::BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use taskseeker_core::settings::Settings;
use taskseeker_observability::trace::Span;
use tokio_util::sync::CancellationToken;

use crate::{
    api_key,
    retry::{run_with_retry, RetryPolicy},
    sse::{parse_delta, SseDecoder, SseEvent},
};

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const ERROR_BODY_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl LlmError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new("E_CANCELLED", "cancelled")
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let (code, message) = match status {
            401 => ("E_LLM_AUTH", "authentication failed".to_string()),
            429 => ("E_LLM_RATE_LIMIT", "rate limit exceeded".to_string()),
            s if s >= 500 => ("E_LLM_UNAVAILABLE", "service unavailable".to_string()),
            s => {
                let body: String = body.trim().chars().take(ERROR_BODY_MAX_CHARS).collect();
                ("E_LLM_HTTP", format!("http {s}: {body}"))
            }
        };
        Self {
            code: code.to_string(),
            message,
            status: Some(status),
        }
    }

    fn transport(e: &reqwest::Error) -> Self {
        let what = if e.is_timeout() {
            "request timed out"
        } else if e.is_connect() {
            "connection failed"
        } else {
            "request failed"
        };
        Self::new("E_LLM_TRANSPORT", format!("{what}: {e}"))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LlmError {}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub base_url: String, // e.g. https://api.deepseek.com
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

pub fn normalize_base_url(s: &str) -> String {
    let mut t = s.trim().trim_end_matches('/').to_string();
    if t.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    // Users paste the full endpoint surprisingly often.
    if let Some(stripped) = t.strip_suffix("/chat/completions") {
        t = stripped.to_string();
    }
    t.trim_end_matches('/').to_string()
}

impl LlmConfig {
    pub fn from_settings(s: &Settings) -> Self {
        let d = Self::default();
        let base_url = s
            .llm_base_url
            .clone()
            .or_else(|| std::env::var("TASKSEEKER_LLM_BASE_URL").ok())
            .unwrap_or_default();
        let model = s
            .llm_model
            .clone()
            .or_else(|| std::env::var("TASKSEEKER_LLM_MODEL").ok())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(d.model);

        let mut retry = d.retry;
        if let Some(n) = s.llm_max_retries {
            retry.max_attempts = n.max(1);
        }
        if let Some(secs) = s.llm_retry_max_delay_secs.filter(|v| v.is_finite() && *v > 0.0) {
            retry.max_delay = Duration::from_secs_f64(secs);
        }

        Self {
            base_url: normalize_base_url(&base_url),
            model,
            system_prompt: s
                .llm_system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty()),
            temperature: s
                .llm_temperature
                .filter(|t| t.is_finite())
                .map(|t| t.clamp(0.0, 2.0))
                .unwrap_or(d.temperature),
            max_tokens: s.llm_max_tokens.filter(|n| *n > 0).unwrap_or(d.max_tokens),
            timeout: s
                .llm_timeout_secs
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.timeout),
            retry,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: Client,
    cfg: LlmConfig,
    api_key: String,
    data_dir: PathBuf,
}

impl ChatClient {
    pub fn new(data_dir: &Path, cfg: LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let http = Client::builder()
            .connect_timeout(cfg.timeout)
            .build()
            .map_err(|e| LlmError::new("E_LLM_TRANSPORT", format!("http client init failed: {e}")))?;
        Ok(Self {
            http,
            cfg,
            api_key,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Resolves the key from env/memory/keyring.
    pub fn from_settings(data_dir: &Path, s: &Settings) -> Result<Self, LlmError> {
        let key = api_key::load_api_key()
            .map_err(|e| LlmError::new("E_LLM_API_KEY_MISSING", format!("{e:#}")))?;
        Self::new(data_dir, LlmConfig::from_settings(s), key)
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn request_body<'a>(&'a self, prompt: &'a str, max_tokens: u32, stream: bool) -> ChatReq<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sp) = self.cfg.system_prompt.as_deref() {
            messages.push(Message {
                role: "system",
                content: sp,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });
        ChatReq {
            model: &self.cfg.model,
            messages,
            temperature: self.cfg.temperature,
            max_tokens,
            stream,
        }
    }

    async fn send_once(&self, body: &ChatReq<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.cfg.base_url);
        let send = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send();
        let resp = tokio::time::timeout(self.cfg.timeout, send)
            .await
            .map_err(|_| LlmError::new("E_LLM_TRANSPORT", "request timed out"))?
            .map_err(|e| LlmError::transport(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body));
        }
        Ok(resp)
    }

    async fn connect(
        &self,
        job_id: Option<&str>,
        body: &ChatReq<'_>,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let span = Span::start(
            &self.data_dir,
            job_id,
            "Llm",
            "LLM.stream_connect",
            Some(serde_json::json!({
                "base_url": self.cfg.base_url,
                "model": self.cfg.model,
                "stream": body.stream,
                "max_attempts": self.cfg.retry.max_attempts,
            })),
        );
        let res = run_with_retry(&self.cfg.retry, token, || self.send_once(body)).await;
        match &res {
            Ok(resp) => span.ok(Some(serde_json::json!({"status": resp.status().as_u16()}))),
            Err(e) if e.code == "E_CANCELLED" => span.skipped("cancelled", None),
            Err(e) => span.err("http", &e.code, &e.message, None),
        }
        res
    }

    async fn complete_with(
        &self,
        job_id: Option<&str>,
        prompt: &str,
        max_tokens: u32,
        token: &CancellationToken,
    ) -> Result<String, LlmError> {
        let body = self.request_body(prompt, max_tokens, false);
        let resp = self.connect(job_id, &body, token).await?;
        let r: ChatResp = tokio::select! {
            _ = token.cancelled() => return Err(LlmError::cancelled()),
            r = tokio::time::timeout(self.cfg.timeout, resp.json::<ChatResp>()) => r
                .map_err(|_| LlmError::new("E_LLM_TRANSPORT", "response timed out"))?
                .map_err(|e| LlmError::new("E_LLM_PARSE", format!("llm response parse failed: {e}")))?,
        };
        let content = r
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::new("E_LLM_PARSE", "llm missing choices[0].message.content"))?;
        Ok(content)
    }

    /// Single-shot completion.
    pub async fn complete(
        &self,
        job_id: Option<&str>,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.complete_with(job_id, prompt, self.cfg.max_tokens, token)
            .await
    }

    /// Cheap round-trip that proves the endpoint, model and key work.
    pub async fn validate(&self) -> Result<(), LlmError> {
        self.complete_with(None, "ping", 5, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Streams content deltas. The request is only sent when the stream is first
    /// polled; retries happen before the first item and never after.
    pub fn stream(
        &self,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<String, LlmError>> {
        let st = StreamState::Connect {
            client: self.clone(),
            job_id,
            prompt,
            token,
        };
        stream::unfold(st, next_item).boxed()
    }
}

type Body = BoxStream<'static, reqwest::Result<Vec<u8>>>;

enum StreamState {
    Connect {
        client: ChatClient,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    },
    Reading {
        body: Body,
        decoder: SseDecoder,
        queue: VecDeque<Result<String, LlmError>>,
        read_timeout: Duration,
        eof: bool,
    },
    Done,
}

fn push_events(events: Vec<SseEvent>, queue: &mut VecDeque<Result<String, LlmError>>) -> bool {
    for ev in events {
        match ev {
            SseEvent::Done => return true,
            SseEvent::Data(payload) => match parse_delta(&payload) {
                Ok(Some(s)) => queue.push_back(Ok(s)),
                Ok(None) => {}
                Err(e) => {
                    queue.push_back(Err(e));
                    return true;
                }
            },
        }
    }
    false
}

async fn next_item(
    mut st: StreamState,
) -> Option<(Result<String, LlmError>, StreamState)> {
    loop {
        st = match st {
            StreamState::Done => return None,
            StreamState::Connect {
                client,
                job_id,
                prompt,
                token,
            } => {
                let body = client.request_body(&prompt, client.cfg.max_tokens, true);
                match client.connect(Some(&job_id), &body, &token).await {
                    Ok(resp) => StreamState::Reading {
                        body: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
                        decoder: SseDecoder::new(),
                        queue: VecDeque::new(),
                        read_timeout: client.cfg.timeout,
                        eof: false,
                    },
                    Err(e) => return Some((Err(e), StreamState::Done)),
                }
            }
            StreamState::Reading {
                mut body,
                mut decoder,
                mut queue,
                read_timeout,
                mut eof,
            } => {
                if let Some(item) = queue.pop_front() {
                    let next = if item.is_err() || (eof && queue.is_empty()) {
                        StreamState::Done
                    } else {
                        StreamState::Reading {
                            body,
                            decoder,
                            queue,
                            read_timeout,
                            eof,
                        }
                    };
                    return Some((item, next));
                }
                if eof {
                    return None;
                }
                match tokio::time::timeout(read_timeout, body.next()).await {
                    Err(_) => {
                        queue.push_back(Err(LlmError::new("E_LLM_TRANSPORT", "stream read timed out")));
                        eof = true;
                    }
                    Ok(None) => {
                        push_events(decoder.finish(), &mut queue);
                        eof = true;
                    }
                    Ok(Some(Err(e))) => {
                        queue.push_back(Err(LlmError::transport(&e)));
                        eof = true;
                    }
                    Ok(Some(Ok(chunk))) => {
                        eof = push_events(decoder.push(&chunk), &mut queue);
                    }
                }
                StreamState::Reading {
                    body,
                    decoder,
                    queue,
                    read_timeout,
                    eof,
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_handles_empty_and_endpoint_suffix() {
        assert_eq!(normalize_base_url(""), "https://api.deepseek.com");
        assert_eq!(
            normalize_base_url(" https://api.deepseek.com/ "),
            "https://api.deepseek.com"
        );
        assert_eq!(
            normalize_base_url("http://api.server/v1/chat/completions/"),
            "http://api.server/v1"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(LlmError::from_status(401, "x").code, "E_LLM_AUTH");
        assert_eq!(LlmError::from_status(429, "").message, "rate limit exceeded");
        assert_eq!(LlmError::from_status(502, "").code, "E_LLM_UNAVAILABLE");
        let e = LlmError::from_status(400, " {\"error\":\"bad\"} ");
        assert_eq!(e.code, "E_LLM_HTTP");
        assert_eq!(e.status, Some(400));
        assert!(e.message.starts_with("http 400: {"));
    }

    #[test]
    fn config_from_settings_applies_overrides_and_bounds() {
        let s = Settings {
            llm_base_url: Some("https://example.test/v1/chat/completions".to_string()),
            llm_model: Some("m1".to_string()),
            llm_temperature: Some(9.0),
            llm_max_tokens: Some(0),
            llm_max_retries: Some(5),
            llm_retry_max_delay_secs: Some(2.5),
            ..Settings::default()
        };
        let c = LlmConfig::from_settings(&s);
        assert_eq!(c.base_url, "https://example.test/v1");
        assert_eq!(c.model, "m1");
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.max_tokens, 1024);
        assert_eq!(c.retry.max_attempts, 5);
        assert_eq!(c.retry.max_delay, Duration::from_millis(2500));
    }

    #[test]
    fn request_body_includes_system_prompt_first() {
        let td = tempfile::tempdir().unwrap();
        let cfg = LlmConfig {
            system_prompt: Some("be brief".to_string()),
            ..LlmConfig::default()
        };
        let c = ChatClient::new(td.path(), cfg, "k".to_string()).unwrap();
        let v = serde_json::to_value(c.request_body("hi", 7, true)).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "hi");
        assert_eq!(v["max_tokens"], 7);
        assert_eq!(v["stream"], true);
    }

    #[test]
    fn push_events_stops_at_done_and_errors() {
        let mut q = VecDeque::new();
        let done = push_events(
            vec![
                SseEvent::Data(r#"{"choices":[{"delta":{"content":"a"}}]}"#.to_string()),
                SseEvent::Done,
                SseEvent::Data(r#"{"choices":[{"delta":{"content":"b"}}]}"#.to_string()),
            ],
            &mut q,
        );
        assert!(done);
        assert_eq!(q.len(), 1);

        let mut q = VecDeque::new();
        assert!(push_events(vec![SseEvent::Data("{\"error\":\"x\"}".to_string())], &mut q));
        assert!(matches!(q.pop_front(), Some(Err(_))));
    }
}
