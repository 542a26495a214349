//! Model Provider
//! Mission: One prediction per model call via OpenRouter chat completions

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

/// Context handed to every model call for one session. Market ingestion is
/// upstream; by the time a session runs we only carry identifiers and the
/// question text the dashboard already resolved.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub market_id: String,
    pub question: Option<String>,
}

impl MarketContext {
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            question: None,
        }
    }
}

/// Async seam between the dispatcher and the model backend. The production
/// implementation talks to OpenRouter; tests substitute scripted providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Invoke one model against one market. The returned payload is opaque
    /// provider data the dashboard renders as-is.
    async fn invoke(&self, model_id: &str, market: &MarketContext) -> Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct OpenRouterProvider {
    http: reqwest::Client,
    api_key: String,
    referer: Option<String>,
    title: Option<String>,
    max_tokens: u32,
    temperature: f64,
    timeout: Duration,
}

impl OpenRouterProvider {
    pub fn from_env(http: reqwest::Client, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }

        let referer = std::env::var("OPENROUTER_HTTP_REFERER")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let title = std::env::var("OPENROUTER_APP_TITLE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let max_tokens = std::env::var("PROVIDER_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(300);
        let temperature = std::env::var("PROVIDER_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.15);

        Ok(Self {
            http,
            api_key,
            referer,
            title,
            max_tokens,
            temperature,
            timeout,
        })
    }

    async fn chat_completion(&self, model: &str, system: &str, user: &str) -> Result<(String, Option<ChatUsage>, u64)> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        };

        let mut http_req = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(self.timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(r) = &self.referer {
            http_req = http_req.header("HTTP-Referer", r);
        }
        if let Some(t) = &self.title {
            http_req = http_req.header("X-Title", t);
        }

        let resp = http_req
            .json(&req)
            .send()
            .await
            .context("openrouter request")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("openrouter {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("openrouter json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok((content, parsed.usage, start.elapsed().as_millis() as u64))
    }
}

#[async_trait]
impl ModelProvider for OpenRouterProvider {
    async fn invoke(&self, model_id: &str, market: &MarketContext) -> Result<serde_json::Value> {
        let system = prediction_system_prompt();
        let user = prediction_user_prompt(market);

        let (content, usage, latency_ms) = self.chat_completion(model_id, &system, &user).await?;
        if content.trim().is_empty() {
            return Err(anyhow!("empty completion from {}", model_id));
        }

        let prediction = parse_prediction_dsl(&content);
        Ok(json!({
            "model": model_id,
            "prediction": prediction,
            "raw": content,
            "usage": {
                "prompt_tokens": usage.as_ref().and_then(|u| u.prompt_tokens),
                "completion_tokens": usage.as_ref().and_then(|u| u.completion_tokens),
                "total_tokens": usage.as_ref().and_then(|u| u.total_tokens),
            },
            "latency_ms": latency_ms,
        }))
    }
}

fn prediction_system_prompt() -> String {
    "You estimate probabilities for prediction-market questions. Respond only in \
     KEY=VALUE lines: OUTCOME=YES|NO, P_TRUE=<0..1>, CONFIDENCE=LOW|MED|HIGH, \
     RATIONALE=<one sentence>."
        .to_string()
}

fn prediction_user_prompt(market: &MarketContext) -> String {
    match &market.question {
        Some(q) => format!("Market: {}\nQuestion: {}", market.market_id, q),
        None => format!("Market: {}", market.market_id),
    }
}

/// Best-effort parse of the KEY=VALUE response. Unparseable lines are
/// dropped; the raw text stays in the payload so nothing is lost.
fn parse_prediction_dsl(raw: &str) -> serde_json::Value {
    let mut outcome: Option<String> = None;
    let mut p_true: Option<f64> = None;
    let mut confidence: Option<String> = None;
    let mut rationale: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim();
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim().to_ascii_uppercase();
        let val = v.trim();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "OUTCOME" => outcome = Some(val.chars().take(16).collect()),
            "P_TRUE" => {
                p_true = val
                    .parse::<f64>()
                    .ok()
                    .filter(|x| x.is_finite())
                    .map(|x| x.clamp(0.0, 1.0));
            }
            "CONFIDENCE" => confidence = Some(val.chars().take(8).collect()),
            "RATIONALE" => rationale = Some(val.chars().take(400).collect()),
            _ => {}
        }
    }

    json!({
        "outcome": outcome,
        "probability": p_true,
        "confidence": confidence,
        "rationale": rationale,
    })
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}
