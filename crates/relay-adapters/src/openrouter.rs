//! OpenRouter chat-completions client implementing [`TextModel`].

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{Classification, ClassificationCandidate};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::http::{classify_reqwest_error, classify_status, retry_after};
use crate::{AdapterError, BackoffPolicy, RetryDisposition, TextModel};

pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const CLASSIFIER_SYSTEM_PROMPT: &str =
    "You are a content classifier for a channel relay. Always respond with a single valid JSON object.";

const EDITOR_SYSTEM_PROMPT: &str = "You are a professional content editor. Improve the text as the user \
     instructs while keeping its main idea and every important fact.";

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub rewrite_temperature: f32,
    pub rewrite_max_tokens: u32,
    pub classify_temperature: f32,
    pub classify_max_tokens: u32,
    pub backoff: BackoffPolicy,
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_OPENROUTER_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            rewrite_temperature: 0.7,
            rewrite_max_tokens: 1000,
            classify_temperature: 0.3,
            classify_max_tokens: 500,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    config: OpenRouterConfig,
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> Result<Self, AdapterError> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::Config("OpenRouter API key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Config(format!("building http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage<'_>>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AdapterError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            max_tokens,
        };
        let backoff = self.config.backoff;

        let mut last_error = AdapterError::Transport("no attempt made".into());
        for attempt in 0..=backoff.max_retries {
            let sent = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: ChatResponse = resp
                            .json()
                            .await
                            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
                        return first_choice_content(parsed);
                    }

                    let hint = retry_after(resp.headers());
                    let detail = resp.text().await.unwrap_or_default();
                    last_error = status_error(status, hint, &detail);
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%status, attempt, "openrouter request failed; retrying");
                        tokio::time::sleep(backoff.delay_with_hint(attempt, hint)).await;
                        continue;
                    }
                    return Err(last_error);
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    last_error = transport_error(&err);
                    if retryable && attempt < backoff.max_retries {
                        warn!(error = %err, attempt, "openrouter transport error; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(last_error);
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl TextModel for OpenRouterClient {
    /// One authenticated request against the model listing. A rejected key
    /// surfaces as [`AdapterError::Auth`].
    async fn check(&self) -> Result<(), AdapterError> {
        if self.config.model.trim().is_empty() {
            return Err(AdapterError::Config("OpenRouter model is empty".into()));
        }
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .instrument(info_span!("openrouter_check", model = %self.config.model))
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status();
        if status.is_success() {
            debug!(%status, "openrouter reachable");
            return Ok(());
        }
        let hint = retry_after(resp.headers());
        let detail = resp.text().await.unwrap_or_default();
        Err(status_error(status, hint, &detail))
    }

    async fn rewrite(&self, text: &str, prompt: &str) -> Result<String, AdapterError> {
        let content = rewrite_message(text, prompt);
        let span = info_span!("openrouter_rewrite", model = %self.config.model);
        let out = self
            .complete(
                vec![ChatMessage {
                    role: "user",
                    content: &content,
                }],
                self.config.rewrite_temperature,
                self.config.rewrite_max_tokens,
            )
            .instrument(span)
            .await?;
        let out = out.trim();
        if out.is_empty() {
            return Err(AdapterError::InvalidResponse("empty rewrite".into()));
        }
        Ok(out.to_string())
    }

    async fn classify(
        &self,
        text: &str,
        candidates: &[ClassificationCandidate],
    ) -> Result<Classification, AdapterError> {
        let prompt = classification_prompt(text, candidates);
        let span = info_span!(
            "openrouter_classify",
            model = %self.config.model,
            candidates = candidates.len()
        );
        let raw = self
            .complete(
                vec![
                    ChatMessage {
                        role: "system",
                        content: CLASSIFIER_SYSTEM_PROMPT,
                    },
                    ChatMessage {
                        role: "user",
                        content: &prompt,
                    },
                ],
                self.config.classify_temperature,
                self.config.classify_max_tokens,
            )
            .instrument(span)
            .await?;
        debug!(response = %raw, "classification response");
        parse_classification(&raw)
    }

    async fn improve(&self, text: &str, prompt: &str) -> Result<String, AdapterError> {
        let content = rewrite_message(text, prompt);
        let span = info_span!("openrouter_improve", model = %self.config.model);
        let out = self
            .complete(
                vec![
                    ChatMessage {
                        role: "system",
                        content: EDITOR_SYSTEM_PROMPT,
                    },
                    ChatMessage {
                        role: "user",
                        content: &content,
                    },
                ],
                self.config.rewrite_temperature,
                self.config.rewrite_max_tokens,
            )
            .instrument(span)
            .await?;
        let out = out.trim();
        if out.is_empty() {
            return Err(AdapterError::InvalidResponse("empty improvement".into()));
        }
        Ok(out.to_string())
    }
}

fn transport_error(err: &reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Transport(err.to_string())
    }
}

fn status_error(status: StatusCode, hint: Option<Duration>, detail: &str) -> AdapterError {
    let detail = relay_core::truncate_chars(detail.trim(), 300);
    match status {
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited { retry_after: hint },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::Auth(format!("http {status}: {detail}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AdapterError::Timeout,
        s if s.is_server_error() => AdapterError::Transport(format!("http {status}: {detail}")),
        _ => AdapterError::InvalidResponse(format!("http {status}: {detail}")),
    }
}

fn first_choice_content(resp: ChatResponse) -> Result<String, AdapterError> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AdapterError::InvalidResponse("response has no choices".into()))
}

/// The rendered prompt normally embeds the text already; append it when it does not.
fn rewrite_message(text: &str, prompt: &str) -> String {
    if text.trim().is_empty() || prompt.contains(text) {
        prompt.to_string()
    } else {
        format!("{prompt}\n\n{text}")
    }
}

fn classification_prompt(text: &str, candidates: &[ClassificationCandidate]) -> String {
    let channels = candidates
        .iter()
        .map(|c| {
            format!(
                "Channel {}: {}\nDescription: {}\nTags: {}\n",
                c.id,
                c.name,
                c.description,
                c.tags.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyze the following post and decide which target channel it fits best.\n\n\
         Post text:\n{text}\n\n\
         Available channels:\n{channels}\n\
         Respond with a JSON object containing:\n\
         - \"target_channel_id\": the id of the best matching channel, or null if none fits\n\
         - \"confidence\": confidence percentage from 0 to 100\n\
         - \"reasoning\": a brief explanation\n\n\
         If the post does not fit any channel, set target_channel_id to null and confidence to 0.\n\n\
         Example:\n\
         {{\"target_channel_id\": 1, \"confidence\": 85, \"reasoning\": \"matches the channel topic\"}}"
    )
}

/// Parse the model's answer, tolerating ```json fences and surrounding prose.
pub(crate) fn parse_classification(raw: &str) -> Result<Classification, AdapterError> {
    let body = extract_json_object(raw)
        .ok_or_else(|| AdapterError::InvalidResponse(format!("no JSON object in: {raw}")))?;
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AdapterError::InvalidResponse(format!("classification JSON: {e}")))?;

    let target_channel_id = match value.get("target_channel_id") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(other) => {
            return Err(AdapterError::InvalidResponse(format!(
                "target_channel_id has unexpected shape: {other}"
            )))
        }
    };
    let confidence = match value.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    let rationale = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Classification {
        target_channel_id,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
        rationale,
    })
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<ClassificationCandidate> {
        vec![
            ClassificationCandidate {
                id: 3,
                name: "Tech".into(),
                description: "gadgets and software".into(),
                tags: vec!["tech".into(), "ai".into()],
            },
            ClassificationCandidate {
                id: 7,
                name: "Sports".into(),
                description: String::new(),
                tags: vec![],
            },
        ]
    }

    #[test]
    fn parses_plain_json() {
        let c = parse_classification(
            r#"{"target_channel_id": 3, "confidence": 91, "reasoning": "about phones"}"#,
        )
        .unwrap();
        assert_eq!(c.target_channel_id, Some(3));
        assert_eq!(c.confidence, 91);
        assert_eq!(c.rationale, "about phones");
    }

    #[test]
    fn parses_fenced_json_with_loose_types() {
        let raw = "Sure!\n```json\n{\"target_channel_id\": \"7\", \"confidence\": \"88.6%\"}\n```";
        let c = parse_classification(raw).unwrap();
        assert_eq!(c.target_channel_id, Some(7));
        assert_eq!(c.confidence, 89);
        assert_eq!(c.rationale, "");
    }

    #[test]
    fn null_target_means_no_match() {
        let c = parse_classification(r#"{"target_channel_id": null, "confidence": 0}"#).unwrap();
        assert_eq!(c.target_channel_id, None);
        assert_eq!(c.confidence, 0);
    }

    #[test]
    fn prose_without_json_is_invalid() {
        assert!(matches!(
            parse_classification("I think channel 3"),
            Err(AdapterError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_classification(r#"{"target_channel_id": [1]}"#),
            Err(AdapterError::InvalidResponse(_))
        ));
    }

    #[test]
    fn confidence_is_clamped() {
        let c = parse_classification(r#"{"target_channel_id": 3, "confidence": 250}"#).unwrap();
        assert_eq!(c.confidence, 100);
    }

    #[test]
    fn prompt_lists_every_candidate() {
        let prompt = classification_prompt("new phone released", &candidates());
        assert!(prompt.contains("Channel 3: Tech"));
        assert!(prompt.contains("Tags: tech, ai"));
        assert!(prompt.contains("Channel 7: Sports"));
        assert!(prompt.contains("new phone released"));
    }

    #[test]
    fn rewrite_message_appends_text_only_when_missing() {
        assert_eq!(rewrite_message("body", "Shorten: body"), "Shorten: body");
        assert_eq!(rewrite_message("body", "Shorten this"), "Shorten this\n\nbody");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(status_error(StatusCode::UNAUTHORIZED, None, "bad key").is_fatal());
        assert!(status_error(StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, "nope"),
            AdapterError::InvalidResponse(_)
        ));
    }

    #[test]
    fn empty_key_is_a_config_error() {
        let err = OpenRouterClient::new(OpenRouterConfig::new(" ", "m")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn check_contacts_the_api() {
        let mut config = OpenRouterConfig::new("not-a-real-key", "openai/gpt-4o-mini");
        config.base_url = "http://127.0.0.1:9".into();
        config.timeout = Duration::from_secs(2);
        config.backoff = BackoffPolicy::none();
        let client = OpenRouterClient::new(config).unwrap();
        let err = client.check().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn check_rejects_an_empty_model() {
        let client = OpenRouterClient::new(OpenRouterConfig::new("key", " ")).unwrap();
        assert!(client.check().await.unwrap_err().is_fatal());
    }
}
