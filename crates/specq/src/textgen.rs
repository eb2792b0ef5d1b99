//! HTTP-backed [`TextGenerator`] implementations for the commercial
//! providers the brief compiler and voter committee talk to.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use specq_retry::{calculate_delay, RetryStrategyConfig, RetryStrategyType};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 529];

fn retry_config() -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: RetryStrategyType::Exponential,
        max_attempts: 4,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(4),
        jitter: 0.0,
    }
}

/// Single-capability port used by the brief compiler and the voter
/// committee: turn a system instruction and a user message into text.
pub trait TextGenerator {
    fn chat(&self, system: &str, user: &str) -> Result<String>;
}

impl TextGenerator for Box<dyn TextGenerator + Send + Sync> {
    fn chat(&self, system: &str, user: &str) -> Result<String> {
        (**self).chat(system, user)
    }
}

enum Transience {
    Retryable,
    Permanent,
}

fn classify(err: &anyhow::Error) -> Transience {
    if let Some(status) = err.downcast_ref::<HttpStatusError>() {
        if TRANSIENT_STATUSES.contains(&status.0) {
            return Transience::Retryable;
        }
        return Transience::Permanent;
    }
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        if req_err.is_timeout() || req_err.is_connect() {
            return Transience::Retryable;
        }
    }
    Transience::Permanent
}

#[derive(Debug)]
struct HttpStatusError(u16, String);

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http {}: {}", self.0, self.1)
    }
}

impl std::error::Error for HttpStatusError {}

fn send_with_retry<F>(mut attempt_fn: F) -> Result<String>
where
    F: FnMut() -> Result<String>,
{
    let config = retry_config();
    let mut attempt = 1;
    loop {
        match attempt_fn() {
            Ok(text) => return Ok(text),
            Err(err) => {
                let retryable = matches!(classify(&err), Transience::Retryable);
                if !retryable || attempt >= config.max_attempts {
                    return Err(err);
                }
                std::thread::sleep(calculate_delay(&config, attempt));
                attempt += 1;
            }
        }
    }
}

fn client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

fn check_status(resp: &reqwest::blocking::Response) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(anyhow::Error::new(HttpStatusError(
        resp.status().as_u16(),
        resp.status().to_string(),
    )))
}

/// `POST {base_url}/v1/messages` with an `x-api-key` header.
pub struct AnthropicTextGenerator {
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicTextGenerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl TextGenerator for AnthropicTextGenerator {
    fn chat(&self, system: &str, user: &str) -> Result<String> {
        send_with_retry(|| {
            let client = client()?;
            let resp = client
                .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": self.model,
                    "max_tokens": 4096,
                    "system": system,
                    "messages": [{"role": "user", "content": user}],
                }))
                .send()
                .map_err(anyhow::Error::new)?;
            check_status(&resp)?;
            let body: Value = resp.json().context("invalid JSON from Anthropic")?;
            let text = body
                .pointer("/content/0/text")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("Anthropic response missing content[0].text"))?;
            Ok(text.to_string())
        })
    }
}

/// `POST {base_url}/v1/chat/completions` with a `Bearer` token. Covers
/// OpenAI itself as well as any OpenAI-compatible endpoint (`glm`,
/// `deepseek`) by pointing `base_url` at the provider's own host.
pub struct OpenAiCompatibleTextGenerator {
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleTextGenerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl TextGenerator for OpenAiCompatibleTextGenerator {
    fn chat(&self, system: &str, user: &str) -> Result<String> {
        send_with_retry(|| {
            let client = client()?;
            let resp = client
                .post(format!(
                    "{}/v1/chat/completions",
                    self.base_url.trim_end_matches('/')
                ))
                .bearer_auth(&self.api_key)
                .json(&json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                }))
                .send()
                .map_err(anyhow::Error::new)?;
            check_status(&resp)?;
            let body: Value = resp.json().context("invalid JSON from OpenAI-compatible endpoint")?;
            let text = body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("response missing choices[0].message.content"))?;
            Ok(text.to_string())
        })
    }
}

/// `POST {base_url}/v1/models/{model}:generateContent?key=...`.
pub struct GoogleTextGenerator {
    base_url: String,
    api_key: String,
    model: String,
}

impl GoogleTextGenerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl TextGenerator for GoogleTextGenerator {
    fn chat(&self, system: &str, user: &str) -> Result<String> {
        send_with_retry(|| {
            let client = client()?;
            let url = format!(
                "{}/v1/models/{}:generateContent",
                self.base_url.trim_end_matches('/'),
                self.model
            );
            let resp = client
                .post(url)
                .query(&[("key", self.api_key.as_str())])
                .json(&json!({
                    "systemInstruction": {"parts": [{"text": system}]},
                    "contents": [{"role": "user", "parts": [{"text": user}]}],
                }))
                .send()
                .map_err(anyhow::Error::new)?;
            check_status(&resp)?;
            let body: Value = resp.json().context("invalid JSON from Google")?;
            let text = body
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("response missing candidates[0].content.parts[0].text"))?;
            Ok(text.to_string())
        })
    }
}

/// Construct a concrete [`TextGenerator`] from a `(provider, model)`
/// pair and an API key, defaulting each provider's base URL.
pub fn build(provider: &str, model: &str, api_key: &str) -> Result<Box<dyn TextGenerator + Send + Sync>> {
    match provider {
        "anthropic" => Ok(Box::new(AnthropicTextGenerator::new(
            "https://api.anthropic.com",
            api_key,
            model,
        ))),
        "openai" => Ok(Box::new(OpenAiCompatibleTextGenerator::new(
            "https://api.openai.com",
            api_key,
            model,
        ))),
        "glm" => Ok(Box::new(OpenAiCompatibleTextGenerator::new(
            "https://open.bigmodel.cn/api/paas/v4",
            api_key,
            model,
        ))),
        "deepseek" => Ok(Box::new(OpenAiCompatibleTextGenerator::new(
            "https://api.deepseek.com",
            api_key,
            model,
        ))),
        "google" => Ok(Box::new(GoogleTextGenerator::new(
            "https://generativelanguage.googleapis.com",
            api_key,
            model,
        ))),
        other => bail!("unknown text generator provider {other:?}"),
    }
}
