pub mod access;
pub mod approval;
pub mod clients;
pub mod context;
pub mod conversation;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod locator;
pub mod models;
pub mod prompt;
pub mod retrieval;
pub mod store;
pub mod streaming;
pub mod traits;
pub mod tutor;

#[cfg(test)]
mod test_support;

pub use access::{parse_user_list, AccessPolicy};
pub use approval::{ApprovalQueue, Decision, PendingPost};
pub use clients::{GeminiClient, GeminiConfig, TelegramClient, TelegramFile, Update};
pub use context::{assemble_pages, char_window, page_list};
pub use conversation::{ChatHistory, Conversation};
pub use error::{GenerationError, IngestError, MessagingError, RetrievalError};
pub use extractor::{extract_pages, LopdfExtractor, PdfExtractor};
pub use ingest::{
    build_index, discover_pdf_files, index_path, preprocess_catalog, preprocess_folder,
    textbook_id_from_path, BuiltIndex, PreprocessReport, SkippedPdf,
};
pub use locator::{best_exercise_match, find_literal, find_matching_pages};
pub use models::{
    CachePolicy, ExerciseContext, ExerciseMatch, FlushPolicy, MatchOrigin, PageRecord,
    PromptOptions, RetrievalOptions, TextbookIndex,
};
pub use prompt::{build_prompt, Grounding, PromptKind, PromptRequest};
pub use retrieval::{exercise_context, Retriever};
pub use store::{validate_textbook_id, TextbookStore};
pub use streaming::{Clock, StreamBuffer, StreamState, SystemClock};
pub use traits::{
    ChatTurn, FragmentStream, ImageInput, InlineButton, MessageId, Messenger, Recipient, Role,
    TextGenerator,
};
pub use tutor::{
    answer_with_textbook, generation_apology, locate_context, parse_command,
    parse_textbook_catalog, Command, TutorConfig, TutorService,
};
