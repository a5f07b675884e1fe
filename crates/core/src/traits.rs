use crate::{GenerationError, MessagingError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub type MessageId = i64;

/// A private chat id or a public `@channel` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Recipient {
    Id(i64),
    Channel(String),
}

impl From<i64> for Recipient {
    fn from(value: i64) -> Self {
        Self::Id(value)
    }
}

impl FromStr for Recipient {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Ok(value
            .parse::<i64>()
            .map(Self::Id)
            .unwrap_or_else(|_| Self::Channel(value.to_string())))
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Channel(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Speaker of a chat turn, named the way the generation API names roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            data,
        }
    }
}

#[async_trait]
pub trait FragmentStream: Send {
    /// `None` once the stream ended normally.
    async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>>;
}

#[async_trait]
pub trait TextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Streams the reply to the last user turn of `turns`, earlier turns
    /// being the conversation so far.
    async fn generate_stream(
        &self,
        turns: &[ChatTurn],
    ) -> Result<Box<dyn FragmentStream>, GenerationError>;

    async fn describe_image(
        &self,
        prompt: &str,
        image: &ImageInput,
    ) -> Result<String, GenerationError>;
}

#[async_trait]
pub trait Messenger {
    async fn send(&self, to: &Recipient, text: &str) -> Result<MessageId, MessagingError>;

    async fn edit(
        &self,
        to: &Recipient,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), MessagingError>;

    async fn send_with_keyboard(
        &self,
        to: &Recipient,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageId, MessagingError>;

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), MessagingError>;

    /// Raw bytes of a file the user uploaded.
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, MessagingError>;
}
