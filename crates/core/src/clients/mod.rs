pub mod gemini;
pub mod telegram;

pub use gemini::{GeminiClient, GeminiConfig, SseDecoder};
pub use telegram::{CallbackQuery, Message, TelegramClient, TelegramFile, Update, User};
