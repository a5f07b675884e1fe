use crate::traits::{ChatTurn, FragmentStream, ImageInput, TextGenerator};
use crate::GenerationError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub safety_threshold: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: 8_192,
            temperature: 0.7,
            safety_threshold: "BLOCK_NONE".to_string(),
        }
    }

    /// Keys may be supplied as a `,`/`;`/whitespace separated list; the first is used.
    pub fn first_key(raw: &str) -> Option<String> {
        raw.split(|ch: char| ch.is_whitespace() || matches!(ch, ',' | ';' | '，' | '；'))
            .map(str::trim)
            .find(|key| !key.is_empty())
            .map(str::to_string)
    }
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
    base_url: Url,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        if config.api_key.trim().is_empty() {
            return Err(GenerationError::NotConfigured(
                "GOOGLE_API_KEY is empty".to_string(),
            ));
        }

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            client: Client::new(),
            base_url: Url::parse(&base)?,
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self, method: &str) -> Result<Url, GenerationError> {
        let model = self
            .config
            .model
            .strip_prefix("models/")
            .unwrap_or(&self.config.model);
        Ok(self.base_url.join(&format!("models/{model}:{method}"))?)
    }

    fn request_body(&self, contents: Value) -> Value {
        let safety = HARM_CATEGORIES
            .iter()
            .map(|category| {
                json!({
                    "category": category,
                    "threshold": self.config.safety_threshold,
                })
            })
            .collect::<Vec<_>>();

        json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.config.max_output_tokens,
                "temperature": self.config.temperature,
            },
            "safetySettings": safety,
        })
    }

    async fn post(&self, url: Url, contents: Value) -> Result<reqwest::Response, GenerationError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&self.request_body(contents))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(GenerationError::Api {
            status,
            details: api_error_message(&body),
        })
    }

    async fn generate_from(&self, contents: Value) -> Result<String, GenerationError> {
        let url = self.endpoint("generateContent")?;
        let response = self.post(url, contents).await?;
        let parsed: GenerateResponse = response.json().await?;

        match response_text(&parsed)? {
            Some(text) => Ok(text),
            None => Err(GenerationError::EmptyResponse),
        }
    }
}

fn prompt_contents(prompt: &str) -> Value {
    json!([{ "role": "user", "parts": [{ "text": prompt }] }])
}

fn chat_contents(turns: &[ChatTurn]) -> Value {
    Value::Array(
        turns
            .iter()
            .map(|turn| json!({ "role": turn.role, "parts": [{ "text": turn.text }] }))
            .collect(),
    )
}

fn image_contents(prompt: &str, image: &ImageInput) -> Value {
    json!([{
        "role": "user",
        "parts": [
            { "text": prompt },
            {
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": STANDARD.encode(&image.data),
                }
            },
        ],
    }])
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.generate_from(prompt_contents(prompt)).await
    }

    async fn generate_stream(
        &self,
        turns: &[ChatTurn],
    ) -> Result<Box<dyn FragmentStream>, GenerationError> {
        if turns.is_empty() {
            return Err(GenerationError::Stream("conversation has no turns".to_string()));
        }

        let mut url = self.endpoint("streamGenerateContent")?;
        url.query_pairs_mut().append_pair("alt", "sse");
        let response = self.post(url, chat_contents(turns)).await?;

        Ok(Box::new(GeminiStream {
            response,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        }))
    }

    async fn describe_image(
        &self,
        prompt: &str,
        image: &ImageInput,
    ) -> Result<String, GenerationError> {
        debug!(bytes = image.data.len(), mime = %image.mime_type, "image prompt");
        self.generate_from(image_contents(prompt, image)).await
    }
}

struct GeminiStream {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

#[async_trait]
impl FragmentStream for GeminiStream {
    async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                let parsed = match serde_json::from_str::<GenerateResponse>(&payload) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        self.done = true;
                        self.pending.clear();
                        return Some(Err(GenerationError::Stream(format!(
                            "undecodable event: {error}"
                        ))));
                    }
                };
                match response_text(&parsed) {
                    Ok(Some(text)) => return Some(Ok(text)),
                    Ok(None) => continue,
                    Err(error) => {
                        self.done = true;
                        self.pending.clear();
                        return Some(Err(error));
                    }
                }
            }

            if self.done {
                return None;
            }

            match self.response.chunk().await {
                Ok(Some(bytes)) => self.pending.extend(self.decoder.push(&bytes)),
                Ok(None) => {
                    self.done = true;
                    self.pending.extend(self.decoder.finish());
                }
                Err(error) => {
                    self.done = true;
                    warn!(%error, "generation stream interrupted");
                    return Some(Err(GenerationError::Stream(error.to_string())));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

/// Text of the first candidate. `Ok(None)` for frames that carry no text.
fn response_text(response: &GenerateResponse) -> Result<Option<String>, GenerationError> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone())
    {
        return Err(GenerationError::Blocked(reason));
    }

    let Some(candidate) = response.candidates.first() else {
        return Ok(None);
    };

    let text = candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default();

    if text.is_empty() {
        return match candidate.finish_reason.as_deref() {
            Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) => {
                Err(GenerationError::Blocked(reason.to_string()))
            }
            _ => Ok(None),
        };
    }

    debug!(chars = text.len(), finish = ?candidate.finish_reason, "generation text received");
    Ok(Some(text))
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Splits a server-sent-events byte stream into `data` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            self.consume_line(line.trim_end_matches(&['\n', '\r'][..]), &mut events);
        }
        events
    }

    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.consume_line(line.trim_end_matches(&['\n', '\r'][..]), &mut events);
        }
        self.consume_line("", &mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}
