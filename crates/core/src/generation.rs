use crate::error::GenerationError;
use crate::models::SearchResult;
use crate::session::{ChatMessage, Role};
use crate::traits::AnswerGenerator;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const GEMINI_MODEL_ENV: &str = "GEMINI_MODEL";
pub const GEMINI_ENDPOINT_ENV: &str = "GEMINI_ENDPOINT";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/";

/// Renders retrieved chunks as citation blocks; a missing page prints as `N/A`.
pub fn format_context(context: &[SearchResult]) -> String {
    context
        .iter()
        .map(|result| {
            let page = result
                .page
                .map(|page| page.to_string())
                .unwrap_or_else(|| "N/A".to_string());
            format!(
                "Source: {}\nPage: {page}\nContent: {}",
                result.source, result.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Based on the following context, please answer the question.\n\
         If the answer cannot be found in the context, say so.\n\n\
         Context:\n{context}\n\nQuestion: {question}\n\nAnswer:"
    )
}

/// Google Gemini `generateContent` over REST.
pub struct GeminiGenerator {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
}

impl GeminiGenerator {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Reads `GEMINI_API_KEY` (required), `GEMINI_MODEL` and `GEMINI_ENDPOINT`.
    pub fn from_env() -> Result<Self, GenerationError> {
        let api_key = non_empty_env(GEMINI_API_KEY_ENV)
            .ok_or_else(|| GenerationError::MissingApiKey(GEMINI_API_KEY_ENV.to_string()))?;
        let model = non_empty_env(GEMINI_MODEL_ENV).unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
        let endpoint =
            non_empty_env(GEMINI_ENDPOINT_ENV).unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.to_string());

        info!(model = %model, endpoint = %endpoint, "using gemini answer generator");
        Self::new(&endpoint, model, api_key)
    }

    fn request_url(&self) -> Result<Url, GenerationError> {
        Ok(self
            .endpoint
            .join(&format!("v1beta/models/{}:generateContent", self.model))?)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn request_body(history: &[ChatMessage], prompt: &str) -> Value {
    let mut contents = history
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": message.content }] })
        })
        .collect::<Vec<_>>();
    contents.push(json!({ "role": "user", "parts": [{ "text": prompt }] }));
    json!({ "contents": contents })
}

fn parse_answer(payload: &Value) -> Result<String, GenerationError> {
    let answer = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.pointer("/text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();

    if !answer.trim().is_empty() {
        return Ok(answer.trim().to_string());
    }

    if let Some(reason) = payload
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(GenerationError::BackendResponse {
            backend: "gemini".to_string(),
            details: format!("prompt blocked: {reason}"),
        });
    }

    Err(GenerationError::EmptyAnswer)
}

#[async_trait]
impl AnswerGenerator for GeminiGenerator {
    async fn generate(
        &self,
        history: &[ChatMessage],
        question: &str,
        context: &[SearchResult],
    ) -> Result<String, GenerationError> {
        let prompt = build_prompt(&format_context(context), question);
        let body = request_body(history, &prompt);
        debug!(model = %self.model, turns = history.len() + 1, "sending generateContent request");

        let response = self
            .client
            .post(self.request_url()?)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(GenerationError::BackendResponse {
                backend: "gemini".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: Value = response.json().await?;
        parse_answer(&parsed)
    }
}

/// Offline generator that answers with the retrieved passages themselves.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveGenerator {
    pub max_passages: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_passages: 3 }
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    async fn generate(
        &self,
        _history: &[ChatMessage],
        question: &str,
        context: &[SearchResult],
    ) -> Result<String, GenerationError> {
        if context.is_empty() {
            return Err(GenerationError::EmptyAnswer);
        }

        let passages = context
            .iter()
            .take(self.max_passages.max(1))
            .enumerate()
            .map(|(position, result)| {
                let page = result
                    .page
                    .map(|page| format!(", page {page}"))
                    .unwrap_or_default();
                format!("[{}] {}{page}: {}", position + 1, result.source, result.text)
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            "The most relevant passages for \"{question}\" are:\n{passages}"
        ))
    }
}
