use crate::traits::{InlineButton, MessageId, Messenger, Recipient};
use crate::MessagingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const TELEGRAM_API_BASE_URL: &str = "https://api.telegram.org";
pub const MAX_MESSAGE_CHARS: usize = 4_096;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

/// `getFile` result; `file_path` is missing once the file expired.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

pub struct TelegramClient {
    client: Client,
    endpoint: String,
    file_endpoint: String,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(TELEGRAM_API_BASE_URL, bot_token)
    }

    pub fn with_base_url(base_url: &str, bot_token: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            client: Client::new(),
            endpoint: format!("{base_url}/bot{bot_token}"),
            file_endpoint: format!("{base_url}/file/bot{bot_token}"),
        }
    }

    pub async fn get_file(&self, file_id: &str) -> Result<TelegramFile, MessagingError> {
        self.call("getFile", &json!({ "file_id": file_id })).await
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/{}", self.file_endpoint, file_path.trim_start_matches('/'))
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, MessagingError> {
        let mut payload = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }

        self.call_with_timeout(
            "getUpdates",
            &payload,
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
    ) -> Result<T, MessagingError> {
        self.call_with_timeout(method, payload, None).await
    }

    async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, MessagingError> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.endpoint, method))
            .json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let envelope: ApiEnvelope<T> = response.json().await?;

        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            (_, _) => Err(MessagingError::Api {
                method: method.to_string(),
                details: envelope
                    .description
                    .unwrap_or_else(|| status.to_string()),
            }),
        }
    }

    async fn send_part(
        &self,
        to: &Recipient,
        text: &str,
        keyboard: Option<&[Vec<InlineButton>]>,
    ) -> Result<MessageId, MessagingError> {
        let mut payload = json!({
            "chat_id": to,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = json!({ "inline_keyboard": keyboard });
        }

        let sent: SentMessage = self.call("sendMessage", &payload).await?;
        debug!(chat = %to, message_id = sent.message_id, "message sent");
        Ok(sent.message_id)
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    /// Long texts go out as several messages; the id of the last one is returned.
    async fn send(&self, to: &Recipient, text: &str) -> Result<MessageId, MessagingError> {
        let parts = split_message(text, MAX_MESSAGE_CHARS);
        if parts.is_empty() {
            return Err(MessagingError::Api {
                method: "sendMessage".to_string(),
                details: "message text is empty".to_string(),
            });
        }

        let mut last = 0;
        for part in &parts {
            last = self.send_part(to, part, None).await?;
        }
        Ok(last)
    }

    async fn edit(
        &self,
        to: &Recipient,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), MessagingError> {
        let payload = json!({
            "chat_id": to,
            "message_id": message_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
            "disable_web_page_preview": true,
        });

        match self.call::<Value>("editMessageText", &payload).await {
            Ok(_) => Ok(()),
            Err(MessagingError::Api { details, .. }) if details.contains("message is not modified") => {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn send_with_keyboard(
        &self,
        to: &Recipient,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageId, MessagingError> {
        let truncated = truncate_chars(text, MAX_MESSAGE_CHARS);
        if truncated.len() < text.len() {
            warn!(chat = %to, chars = text.chars().count(), "keyboard message truncated");
        }
        self.send_part(to, truncated, Some(keyboard)).await
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), MessagingError> {
        let mut payload = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = json!(text);
        }
        self.call::<Value>("answerCallbackQuery", &payload).await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, MessagingError> {
        let file = self.get_file(file_id).await?;
        let Some(file_path) = file.file_path else {
            return Err(MessagingError::Api {
                method: "getFile".to_string(),
                details: format!("file {file_id} has no download path"),
            });
        };

        let response = self.client.get(self.file_url(&file_path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MessagingError::Api {
                method: "download".to_string(),
                details: status.to_string(),
            });
        }

        let bytes = response.bytes().await?;
        debug!(file_id, bytes = bytes.len(), "file downloaded");
        Ok(bytes.to_vec())
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

/// Splits text into parts of at most `max_chars` characters, preferring to
/// break after a newline in the second half of each part.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let head = truncate_chars(rest, max_chars);
        if head.len() == rest.len() {
            parts.push(rest.to_string());
            break;
        }

        let cut = head
            .rfind('\n')
            .filter(|newline| head[..*newline].chars().count() >= max_chars / 2)
            .map_or(head.len(), |newline| newline + 1);

        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_part() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn long_text_prefers_newline_breaks() {
        let parts = split_message("aaaaaa\nbbbbbbbbb", 10);
        assert_eq!(parts, vec!["aaaaaa\n".to_string(), "bbbbbbbbb".to_string()]);
    }

    #[test]
    fn text_without_newlines_is_cut_at_the_limit() {
        let parts = split_message("ሀለሐመሠረሰ", 3);
        assert_eq!(parts, vec!["ሀለሐ", "መሠረ", "ሰ"]);
        assert!(parts.iter().all(|part| part.chars().count() <= 3));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("ሀለሐ", 2), "ሀለ");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn updates_deserialize_from_bot_api_payloads() -> Result<(), serde_json::Error> {
        let message: Update = serde_json::from_str(
            r#"{"update_id":10,"message":{"message_id":5,"from":{"id":7,"is_bot":false,"username":"abebe"},"chat":{"id":7,"type":"private"},"text":"/explain inflation economics9"}}"#,
        )?;
        let inner = message.message.as_ref().map(|m| m.text.clone());
        assert_eq!(inner, Some(Some("/explain inflation economics9".to_string())));

        let callback: Update = serde_json::from_str(
            r#"{"update_id":11,"callback_query":{"id":"cb1","from":{"id":1},"data":"forward:3","chat_instance":"x"}}"#,
        )?;
        assert_eq!(
            callback.callback_query.and_then(|query| query.data),
            Some("forward:3".to_string())
        );
        Ok(())
    }

    #[test]
    fn failed_envelope_keeps_description() -> Result<(), serde_json::Error> {
        let envelope: ApiEnvelope<SentMessage> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )?;
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(
            envelope.description.as_deref(),
            Some("Bad Request: chat not found")
        );
        Ok(())
    }

    #[test]
    fn file_urls_use_the_file_endpoint() -> Result<(), serde_json::Error> {
        let client = TelegramClient::with_base_url("http://localhost:8081/", "123:abc");
        assert_eq!(
            client.file_url("photos/file_7.jpg"),
            "http://localhost:8081/file/bot123:abc/photos/file_7.jpg"
        );

        let file: TelegramFile = serde_json::from_str(
            r#"{"file_id":"AgAD","file_unique_id":"u1","file_size":2048,"file_path":"photos/file_7.jpg"}"#,
        )?;
        assert_eq!(file.file_path.as_deref(), Some("photos/file_7.jpg"));
        assert_eq!(file.file_size, Some(2048));
        Ok(())
    }
}
