use crate::access::AccessPolicy;
use crate::approval::{ApprovalQueue, Decision};
use crate::clients::telegram::{CallbackQuery, Message, PhotoSize, Update, MAX_MESSAGE_CHARS};
use crate::conversation::ChatHistory;
use crate::models::{FlushPolicy, PromptOptions};
use crate::prompt::{build_prompt, Grounding, PromptKind, PromptRequest};
use crate::retrieval::Retriever;
use crate::store::validate_textbook_id;
use crate::streaming::StreamBuffer;
use crate::traits::{
    ChatTurn, ImageInput, InlineButton, MessageId, Messenger, Recipient, TextGenerator,
};
use crate::{GenerationError, MessagingError, RetrievalError};
use chrono::Utc;
use tracing::{info, warn};

const ADMIN_ONLY: &str =
    "You are not the administrator or your administrator ID is set incorrectly!!!";
const DEBUG_ONLY: &str = "Debug mode is not enabled!";
const UNKNOWN_COMMAND: &str = "Invalid command, use /help for help";
const UNRECOGNIZED_CONTENT: &str = "The content you sent is not recognized\n\n/help";
const NEW_CHAT_STARTED: &str = "We're having a fresh chat now!";
const NEW_CHAT_HINT: &str = "\n\nType /new to kick off a new chat.";
/// A chat longer than this many turns gets the `/new` hint.
const NEW_CHAT_HINT_AFTER: usize = 5;
const DEFAULT_PHOTO_PROMPT: &str = "describe the photo and answer all questions if it has";
const PHOTO_DOWNLOAD_FAILED: &str = "Error: Could not download or process the image from Telegram.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    MyInfo,
    Textbooks,
    AllowedUsers,
    Pending,
    NewChat,
    Ask {
        kind: PromptKind,
        subject: String,
        textbook_id: String,
    },
    Unknown(String),
}

/// Parses `/name args`. Malformed tutoring commands yield the usage hint.
pub fn parse_command(text: &str) -> Result<Command, String> {
    let body = text.trim().trim_start_matches('/');
    let (head, rest) = body
        .split_once(char::is_whitespace)
        .unwrap_or((body, ""));
    let name = head
        .split_once('@')
        .map_or(head, |(name, _bot)| name)
        .to_lowercase();

    let kind = match name.as_str() {
        "start" => return Ok(Command::Start),
        "help" => return Ok(Command::Help),
        "get_my_info" => return Ok(Command::MyInfo),
        "textbooks" => return Ok(Command::Textbooks),
        "get_allowed_users" => return Ok(Command::AllowedUsers),
        "pending" => return Ok(Command::Pending),
        "new" => return Ok(Command::NewChat),
        "explain" => PromptKind::Explain,
        "note" => PromptKind::Note,
        "questions" => PromptKind::Questions,
        "answer" => PromptKind::AnswerExercise,
        _ => return Ok(Command::Unknown(name)),
    };

    let mut words = rest.split_whitespace().collect::<Vec<_>>();
    let Some(textbook_id) = words.pop() else {
        return Err(kind.usage());
    };
    if words.is_empty() {
        return Err(kind.usage());
    }
    if let Err(RetrievalError::Validation(reason)) = validate_textbook_id(textbook_id) {
        return Err(format!("{}\n({reason})", kind.usage()));
    }

    Ok(Command::Ask {
        kind,
        subject: words.join(" "),
        textbook_id: textbook_id.to_string(),
    })
}

/// `"economics9=Economics G9,history9"` -> `[("economics9", "Economics G9"), ("history9", "history9")]`.
pub fn parse_textbook_catalog(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (id, name) = entry.split_once('=').unwrap_or((entry, entry));
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            let name = if name.trim().is_empty() { id } else { name.trim() };
            Some((id.to_string(), name.to_string()))
        })
        .collect()
}

pub fn generation_apology(error: &GenerationError) -> String {
    match error {
        GenerationError::Blocked(reason) => format!(
            "Sorry, the AI declined to answer this request ({reason}). Please rephrase it."
        ),
        other => format!(
            "Oops! Something went wrong with the AI: {other}. Please try again later or rephrase your request."
        ),
    }
}

/// Excerpt and grounding for a tutoring command. An unknown textbook or
/// a query without matches yields `Grounding::None`.
pub fn locate_context(
    retriever: &Retriever,
    kind: PromptKind,
    subject: &str,
    textbook_id: &str,
) -> Result<(String, Grounding), RetrievalError> {
    if kind == PromptKind::AnswerExercise {
        let context = retriever.find_exercise_context(textbook_id, subject)?;
        return Ok(if context.found {
            (context.text, Grounding::Exercise)
        } else {
            (String::new(), Grounding::None)
        });
    }

    let max_pages = retriever.options().max_pages;
    let pages = retriever.find_pages(textbook_id, subject, max_pages)?;
    if pages.is_empty() {
        return Ok((String::new(), Grounding::None));
    }
    let context = retriever.assemble(textbook_id, &pages);
    Ok((context, Grounding::Pages(pages)))
}

/// Grounds the prompt when the textbook has a match, then asks the generator.
/// Generation failures come back as the apology text, never as an error.
pub async fn answer_with_textbook<G>(
    retriever: &Retriever,
    generator: &G,
    options: &PromptOptions,
    kind: PromptKind,
    subject: &str,
    textbook_id: &str,
) -> String
where
    G: TextGenerator + Sync + ?Sized,
{
    let (context, grounding) = match locate_context(retriever, kind, subject, textbook_id) {
        Ok(found) => found,
        Err(RetrievalError::Validation(_)) => return kind.usage(),
        Err(error) => {
            warn!(textbook_id, %error, "retrieval failed, answering without grounding");
            (String::new(), Grounding::None)
        }
    };

    let request = PromptRequest {
        kind,
        subject,
        textbook_id,
        context: &context,
        grounding,
    };
    let prompt = build_prompt(&request, options);
    info!(
        command = kind.command(),
        textbook_id,
        grounded = request.is_grounded(),
        prompt_chars = prompt.len(),
        "prompt assembled"
    );

    match generator.generate(&prompt).await {
        Ok(text) => format!("{}\n\n{}", text.trim_end(), request.reference_line()),
        Err(error) => {
            warn!(%error, "generation failed");
            generation_apology(&error)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TutorConfig {
    pub textbooks: Vec<(String, String)>,
    pub channel: Option<Recipient>,
    pub debug_mode: bool,
    pub flush: FlushPolicy,
    pub prompt: PromptOptions,
    pub message_limit: usize,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            textbooks: Vec::new(),
            channel: None,
            debug_mode: false,
            flush: FlushPolicy::default(),
            prompt: PromptOptions::default(),
            message_limit: MAX_MESSAGE_CHARS,
        }
    }
}

/// Handles one bot update at a time: commands, streamed chat replies and
/// the admin approval of channel posts.
pub struct TutorService<G, M>
where
    G: TextGenerator,
    M: Messenger,
{
    retriever: Retriever,
    generator: G,
    messenger: M,
    access: AccessPolicy,
    approvals: ApprovalQueue,
    history: ChatHistory,
    config: TutorConfig,
}

/// What a streamed exchange showed the user, and the clean answer when the
/// stream completed.
struct Relayed {
    reply: String,
    answer: Option<String>,
}

impl<G, M> TutorService<G, M>
where
    G: TextGenerator + Send + Sync,
    M: Messenger + Send + Sync,
{
    pub fn new(
        retriever: Retriever,
        generator: G,
        messenger: M,
        access: AccessPolicy,
        config: TutorConfig,
    ) -> Self {
        Self {
            retriever,
            generator,
            messenger,
            access,
            approvals: ApprovalQueue::default(),
            history: ChatHistory::default(),
            config,
        }
    }

    pub fn messenger(&self) -> &M {
        &self.messenger
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub async fn handle_update(&mut self, update: &Update) -> Result<(), MessagingError> {
        if let Some(callback) = &update.callback_query {
            return self.handle_callback(callback).await;
        }
        match &update.message {
            Some(message) => self.handle_message(message).await,
            None => Ok(()),
        }
    }

    async fn handle_message(&mut self, message: &Message) -> Result<(), MessagingError> {
        let chat = Recipient::Id(message.chat.id);
        let user_id = message.from.as_ref().map_or(message.chat.id, |user| user.id);
        let username = message
            .from
            .as_ref()
            .and_then(|user| user.username.as_deref())
            .unwrap_or("unknown")
            .to_string();
        let authorized = self
            .access
            .is_authorized(user_id, message.from.as_ref().and_then(|user| user.username.as_deref()));

        info!(user_id, %username, authorized, "update received");

        if let Some(text) = message.text.as_deref().filter(|text| text.starts_with('/')) {
            let reply = self.execute_command(user_id, authorized, text).await;
            self.messenger.send(&chat, &reply).await?;
            self.admin_log(&format!(
                "@{username} id:`{user_id}` The command sent is:\n{text}\nThe reply content is:\n{reply}"
            ))
            .await;
            if authorized && matches!(parse_command(text), Ok(Command::Ask { .. })) {
                self.offer_for_channel(
                    user_id,
                    format!("A command was sent:\n{text}\nThe reply content is:\n{reply}"),
                )
                .await;
            }
            return Ok(());
        }

        if !authorized {
            self.messenger
                .send(&chat, &format!("You are not allowed to use this bot.\nID:`{user_id}`"))
                .await?;
            self.admin_log(&format!("@{username} id:`{user_id}` No rights to use the bot"))
                .await;
            return Ok(());
        }

        if let Some(text) = message.text.as_deref().filter(|text| !text.trim().is_empty()) {
            let hint_due = self.history.history_length(user_id) + 2 > NEW_CHAT_HINT_AFTER;
            let turns = self.history.turns_for(user_id, text);
            let relayed = self
                .relay_stream(&chat, &turns, hint_due.then_some(NEW_CHAT_HINT))
                .await?;
            if let Some(answer) = &relayed.answer {
                self.history.record(user_id, text, answer);
            }
            let reply = relayed.reply;
            self.admin_log(&format!(
                "@{username} id:`{user_id}` The content sent is:\n{text}\nThe reply content is:\n{reply}"
            ))
            .await;
            self.offer_for_channel(user_id, format!("Text received: {text}\nReply: {reply}"))
                .await;
            return Ok(());
        }

        // Telegram lists sizes smallest first.
        if let Some(photo) = message.photo.last() {
            let caption = message
                .caption
                .as_deref()
                .map(str::trim)
                .filter(|caption| !caption.is_empty())
                .unwrap_or(DEFAULT_PHOTO_PROMPT);
            let reply = self.answer_photo(photo, caption).await;
            self.messenger.send(&chat, &reply).await?;
            self.admin_log(&format!(
                "@{username} id:`{user_id}` [photo] The accompanying message is:\n{caption}\nThe reply content is:\n{reply}"
            ))
            .await;
            self.offer_for_channel(
                user_id,
                format!("Photo received:\nCaption: {caption}\nReply: {reply}"),
            )
            .await;
            return Ok(());
        }

        self.messenger.send(&chat, UNRECOGNIZED_CONTENT).await?;
        self.admin_log(&format!("@{username} id:`{user_id}` Sent unrecognized content"))
            .await;
        Ok(())
    }

    pub async fn execute_command(&mut self, user_id: i64, authorized: bool, text: &str) -> String {
        let command = match parse_command(text) {
            Ok(command) => command,
            Err(usage) => return usage,
        };

        match command {
            Command::Start | Command::Help => self.help_text(),
            Command::MyInfo => format!("your telegram id is: `{user_id}`"),
            Command::Textbooks => self.textbook_listing(),
            Command::AllowedUsers => {
                if !self.access.is_admin(user_id) {
                    return ADMIN_ONLY.to_string();
                }
                if !self.config.debug_mode {
                    return DEBUG_ONLY.to_string();
                }
                let users = self.access.allowed_users();
                if users.is_empty() {
                    "No allowed users are configured.".to_string()
                } else {
                    users.join("\n")
                }
            }
            Command::Pending => {
                if !self.access.is_admin(user_id) {
                    return ADMIN_ONLY.to_string();
                }
                format!(
                    "{} post(s) waiting for approval.",
                    self.approvals.pending_count()
                )
            }
            Command::NewChat => {
                self.history.reset(user_id);
                NEW_CHAT_STARTED.to_string()
            }
            Command::Ask {
                kind,
                subject,
                textbook_id,
            } => {
                if !authorized {
                    return format!("You are not allowed to use this bot.\nID:`{user_id}`");
                }
                self.answer(kind, &subject, &textbook_id).await
            }
            Command::Unknown(_) => UNKNOWN_COMMAND.to_string(),
        }
    }

    pub async fn answer(&self, kind: PromptKind, subject: &str, textbook_id: &str) -> String {
        answer_with_textbook(
            &self.retriever,
            &self.generator,
            &self.config.prompt,
            kind,
            subject,
            textbook_id,
        )
        .await
    }

    /// Downloads the largest photo size and asks the generator about it.
    async fn answer_photo(&self, photo: &PhotoSize, prompt: &str) -> String {
        let data = match self.messenger.download_file(&photo.file_id).await {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => {
                warn!(file_id = %photo.file_id, "photo download was empty");
                return PHOTO_DOWNLOAD_FAILED.to_string();
            }
            Err(error) => {
                warn!(file_id = %photo.file_id, %error, "photo download failed");
                return PHOTO_DOWNLOAD_FAILED.to_string();
            }
        };

        match self.generator.describe_image(prompt, &ImageInput::jpeg(data)).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => generation_apology(&GenerationError::EmptyResponse),
            Err(error) => {
                warn!(%error, "image answer failed");
                generation_apology(&error)
            }
        }
    }

    /// Streams a chat answer, sending the first batch and editing it with
    /// later ones until the message limit forces a new message. `trailer` is
    /// published after a complete answer only.
    async fn relay_stream(
        &self,
        chat: &Recipient,
        turns: &[ChatTurn],
        trailer: Option<&str>,
    ) -> Result<Relayed, MessagingError> {
        let mut stream = match self.generator.generate_stream(turns).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "stream could not start");
                let apology = generation_apology(&error);
                self.messenger.send(chat, &apology).await?;
                return Ok(Relayed {
                    reply: apology,
                    answer: None,
                });
            }
        };

        let mut buffer = StreamBuffer::new(self.config.flush);
        let mut current: Option<(MessageId, String)> = None;
        let mut reply = String::new();
        let mut answer = String::new();
        let mut failed = false;

        loop {
            let event =
                tokio::time::timeout(self.config.flush.max_interval, stream.next_fragment()).await;

            let (batch, finished) = match event {
                Ok(Some(Ok(fragment))) => {
                    answer.push_str(&fragment);
                    (buffer.fragment_received(&fragment), false)
                }
                Ok(Some(Err(error))) => {
                    warn!(%error, "stream ended with an error");
                    failed = true;
                    let mut rest = buffer.finish().unwrap_or_default();
                    rest.push_str(&format!("\n\n{}", generation_apology(&error)));
                    (Some(rest), true)
                }
                Ok(None) => (buffer.finish(), true),
                Err(_elapsed) => (buffer.tick(), false),
            };

            if let Some(batch) = batch {
                reply.push_str(&batch);
                self.publish(chat, &mut current, &batch).await?;
                buffer.delivered();
            }
            if finished {
                break;
            }
        }

        if failed {
            return Ok(Relayed {
                reply,
                answer: None,
            });
        }
        if answer.trim().is_empty() {
            let apology = generation_apology(&GenerationError::EmptyResponse);
            self.messenger.send(chat, &apology).await?;
            return Ok(Relayed {
                reply: apology,
                answer: None,
            });
        }

        if let Some(trailer) = trailer {
            reply.push_str(trailer);
            self.publish(chat, &mut current, trailer).await?;
        }
        Ok(Relayed {
            reply,
            answer: Some(answer),
        })
    }

    async fn publish(
        &self,
        chat: &Recipient,
        current: &mut Option<(MessageId, String)>,
        batch: &str,
    ) -> Result<(), MessagingError> {
        if let Some((message_id, shown)) = current.as_mut() {
            if shown.chars().count() + batch.chars().count() <= self.config.message_limit {
                shown.push_str(batch);
                return self.messenger.edit(chat, *message_id, shown).await;
            }
        }

        if batch.trim().is_empty() {
            return Ok(());
        }
        let message_id = self.messenger.send(chat, batch).await?;
        *current = Some((message_id, batch.to_string()));
        Ok(())
    }

    async fn offer_for_channel(&mut self, author_id: i64, text: String) {
        let (Some(admin_id), Some(_channel)) = (self.access.admin_id, self.config.channel.as_ref())
        else {
            return;
        };

        let id = self.approvals.submit(author_id, text.clone());
        let keyboard = vec![vec![
            InlineButton {
                text: "Forward".to_string(),
                callback_data: Decision::Forward.callback_data(id),
            },
            InlineButton {
                text: "Don't Forward".to_string(),
                callback_data: Decision::Cancel.callback_data(id),
            },
        ]];
        let prompt = format!("Do you want to forward this message to the channel?\n\n{text}");

        if let Err(error) = self
            .messenger
            .send_with_keyboard(&Recipient::Id(admin_id), &prompt, &keyboard)
            .await
        {
            warn!(id, %error, "approval request could not be delivered");
            self.approvals.deny(id);
        }
    }

    async fn handle_callback(&mut self, callback: &CallbackQuery) -> Result<(), MessagingError> {
        let admin = Recipient::Id(callback.from.id);

        if !self.access.is_admin(callback.from.id) {
            return self
                .messenger
                .answer_callback(&callback.id, Some("Only the administrator can approve posts."))
                .await;
        }

        let Some((decision, id)) = callback.data.as_deref().and_then(Decision::parse_callback)
        else {
            return self
                .messenger
                .answer_callback(&callback.id, Some("Unknown action."))
                .await;
        };

        let reply = match decision {
            Decision::Forward => match (self.approvals.approve(id), self.config.channel.clone()) {
                (Some(post), Some(channel)) => {
                    self.messenger.send(&channel, &post.text).await?;
                    info!(id, channel = %channel, "post forwarded");
                    "Message forwarded to the channel."
                }
                (Some(_), None) => "No channel is configured.",
                (None, _) => "This post was already handled.",
            },
            Decision::Cancel => match self.approvals.deny(id) {
                Some(_) => "Message forwarding canceled.",
                None => "This post was already handled.",
            },
        };

        self.messenger.answer_callback(&callback.id, None).await?;
        self.messenger.send(&admin, reply).await?;
        Ok(())
    }

    async fn admin_log(&self, text: &str) {
        if !self.config.debug_mode {
            return;
        }
        let Some(admin_id) = self.access.admin_id else {
            return;
        };

        let stamped = format!(
            "LOG [{}]:\n{text}",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        if let Err(error) = self.messenger.send(&Recipient::Id(admin_id), &stamped).await {
            warn!(%error, "admin log could not be delivered");
        }
    }

    fn help_text(&self) -> String {
        let mut help = String::from(
            "Welcome! I answer questions with Gemini and can ground answers in your textbooks.\n\n\
             /explain [concept] [textbook_id] - explain a concept\n\
             /note [topic] [textbook_id] - short study note\n\
             /questions [topic] [textbook_id] - practice questions\n\
             /answer [exercise_query] [textbook_id] - solve a textbook exercise\n\
             /new - start a new chat\n\
             /textbooks - list textbooks\n\
             /get_my_info - show your telegram id\n\n\
             Any other text starts a normal chat.",
        );
        if !self.config.textbooks.is_empty() {
            help.push_str("\n\nTextbook ids: ");
            help.push_str(
                &self
                    .config
                    .textbooks
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        help
    }

    fn textbook_listing(&self) -> String {
        if self.config.textbooks.is_empty() {
            return "No textbooks are configured.".to_string();
        }

        self.config
            .textbooks
            .iter()
            .map(|(id, name)| match self.retriever.get_textbook(id) {
                Some(index) => format!("{id} - {name} ({} pages)", index.page_count()),
                None => format!("{id} - {name} (not indexed yet)"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::telegram::{Chat, User};
    use crate::traits::Role;
    use crate::ingest::build_index;
    use crate::models::{PageRecord, RetrievalOptions};
    use crate::store::TextbookStore;
    use crate::traits::FragmentStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const ADMIN: i64 = 1;
    const STUDENT: i64 = 7;

    #[derive(Default)]
    struct FakeGenerator {
        reply: Option<String>,
        fragments: Vec<Result<String, String>>,
        /// Wait before each fragment, by position; missing entries mean none.
        delays: Vec<Duration>,
        prompts: Mutex<Vec<String>>,
        chats: Mutex<Vec<Vec<ChatTurn>>>,
        images: Mutex<Vec<(String, Vec<u8>)>>,
    }

    struct FakeStream {
        fragments: VecDeque<(Duration, Result<String, String>)>,
        ready_at: Option<tokio::time::Instant>,
    }

    #[async_trait]
    impl FragmentStream for FakeStream {
        // The deadline survives a cancelled wait, like a real network read.
        async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>> {
            let delay = self.fragments.front()?.0;
            let ready_at = *self
                .ready_at
                .get_or_insert_with(|| tokio::time::Instant::now() + delay);
            tokio::time::sleep_until(ready_at).await;
            self.ready_at = None;
            self.fragments
                .pop_front()
                .map(|(_, item)| item.map_err(GenerationError::Stream))
        }
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply
                .clone()
                .ok_or_else(|| GenerationError::Api {
                    status: 429,
                    details: "quota exceeded".to_string(),
                })
        }

        async fn generate_stream(
            &self,
            turns: &[ChatTurn],
        ) -> Result<Box<dyn FragmentStream>, GenerationError> {
            self.chats.lock().unwrap().push(turns.to_vec());
            let fragments = self
                .fragments
                .iter()
                .cloned()
                .enumerate()
                .map(|(position, item)| {
                    let delay = self.delays.get(position).copied().unwrap_or_default();
                    (delay, item)
                })
                .collect();
            Ok(Box::new(FakeStream {
                fragments,
                ready_at: None,
            }))
        }

        async fn describe_image(
            &self,
            prompt: &str,
            image: &ImageInput,
        ) -> Result<String, GenerationError> {
            self.images
                .lock()
                .unwrap()
                .push((prompt.to_string(), image.data.clone()));
            self.reply.clone().ok_or(GenerationError::EmptyResponse)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Outbound {
        Send(Recipient, String),
        Edit(Recipient, MessageId, String),
        Keyboard(Recipient, String, Vec<String>),
        Callback(String, Option<String>),
        Download(String),
    }

    #[derive(Default)]
    struct FakeMessenger {
        log: Mutex<Vec<Outbound>>,
        broken_downloads: bool,
    }

    impl FakeMessenger {
        fn outbound(&self) -> Vec<Outbound> {
            self.log.lock().unwrap().clone()
        }

        fn sent_to(&self, to: &Recipient) -> Vec<String> {
            self.outbound()
                .into_iter()
                .filter_map(|item| match item {
                    Outbound::Send(recipient, text) if &recipient == to => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send(&self, to: &Recipient, text: &str) -> Result<MessageId, MessagingError> {
            let mut log = self.log.lock().unwrap();
            log.push(Outbound::Send(to.clone(), text.to_string()));
            Ok(log.len() as MessageId)
        }

        async fn edit(
            &self,
            to: &Recipient,
            message_id: MessageId,
            text: &str,
        ) -> Result<(), MessagingError> {
            self.log
                .lock()
                .unwrap()
                .push(Outbound::Edit(to.clone(), message_id, text.to_string()));
            Ok(())
        }

        async fn send_with_keyboard(
            &self,
            to: &Recipient,
            text: &str,
            keyboard: &[Vec<InlineButton>],
        ) -> Result<MessageId, MessagingError> {
            let data = keyboard
                .iter()
                .flatten()
                .map(|button| button.callback_data.clone())
                .collect();
            let mut log = self.log.lock().unwrap();
            log.push(Outbound::Keyboard(to.clone(), text.to_string(), data));
            Ok(log.len() as MessageId)
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            text: Option<&str>,
        ) -> Result<(), MessagingError> {
            self.log.lock().unwrap().push(Outbound::Callback(
                callback_id.to_string(),
                text.map(str::to_string),
            ));
            Ok(())
        }

        async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, MessagingError> {
            self.log
                .lock()
                .unwrap()
                .push(Outbound::Download(file_id.to_string()));
            if self.broken_downloads {
                return Err(MessagingError::Api {
                    method: "download".to_string(),
                    details: "404 Not Found".to_string(),
                });
            }
            Ok(format!("jpeg:{file_id}").into_bytes())
        }
    }

    fn channel() -> Recipient {
        Recipient::Channel("@telegemin".to_string())
    }

    type Fixture = (TempDir, TutorService<FakeGenerator, FakeMessenger>);

    fn service(
        generator: FakeGenerator,
        auth_enabled: bool,
        flush: FlushPolicy,
    ) -> Result<Fixture, Box<dyn std::error::Error>> {
        service_with(generator, FakeMessenger::default(), auth_enabled, TutorConfig {
            flush,
            ..TutorConfig::default()
        })
    }

    fn service_with(
        generator: FakeGenerator,
        messenger: FakeMessenger,
        auth_enabled: bool,
        base: TutorConfig,
    ) -> Result<Fixture, Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        build_index(
            dir.path(),
            "economics9",
            vec![
                PageRecord {
                    page_number: 1,
                    text: "Chapter 1 Scarcity".to_string(),
                },
                PageRecord {
                    page_number: 2,
                    text: "Inflation is a general rise in prices.".to_string(),
                },
                PageRecord {
                    page_number: 3,
                    text: "Part I: Question 3.2 Explain inflation.".to_string(),
                },
            ],
        )?;
        let retriever = Retriever::new(
            Arc::new(TextbookStore::new(dir.path())),
            RetrievalOptions::default(),
        );
        let config = TutorConfig {
            textbooks: parse_textbook_catalog("economics9=Economics G9,history9=History G9"),
            channel: Some(channel()),
            ..base
        };
        let access = AccessPolicy::new(auth_enabled, "abebe", Some(ADMIN));
        Ok((
            dir,
            TutorService::new(retriever, generator, messenger, access, config),
        ))
    }

    fn text_update(user_id: i64, username: &str, text: &str) -> Update {
        Update {
            update_id: 1,
            message: Some(Message {
                message_id: 10,
                from: Some(User {
                    id: user_id,
                    username: Some(username.to_string()),
                }),
                chat: Chat { id: user_id },
                text: Some(text.to_string()),
                caption: None,
                photo: Vec::new(),
            }),
            callback_query: None,
        }
    }

    fn photo_update(user_id: i64, caption: Option<&str>) -> Update {
        let mut update = text_update(user_id, "abebe", "");
        if let Some(message) = update.message.as_mut() {
            message.text = None;
            message.caption = caption.map(str::to_string);
            message.photo = vec![
                PhotoSize {
                    file_id: "small".to_string(),
                },
                PhotoSize {
                    file_id: "large".to_string(),
                },
            ];
        }
        update
    }

    fn streaming(fragments: &[&str]) -> FakeGenerator {
        FakeGenerator {
            fragments: fragments.iter().map(|text| Ok(text.to_string())).collect(),
            ..FakeGenerator::default()
        }
    }

    fn callback_update(user_id: i64, data: &str) -> Update {
        Update {
            update_id: 2,
            message: None,
            callback_query: Some(CallbackQuery {
                id: "cb".to_string(),
                from: User {
                    id: user_id,
                    username: None,
                },
                data: Some(data.to_string()),
            }),
        }
    }

    fn answering(reply: &str) -> FakeGenerator {
        FakeGenerator {
            reply: Some(reply.to_string()),
            ..FakeGenerator::default()
        }
    }

    #[test]
    fn commands_parse_with_bot_suffix_and_multiword_subjects() {
        assert_eq!(
            parse_command("/Explain@TutorBot supply and demand economics9"),
            Ok(Command::Ask {
                kind: PromptKind::Explain,
                subject: "supply and demand".to_string(),
                textbook_id: "economics9".to_string(),
            })
        );
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("/new@TutorBot"), Ok(Command::NewChat));
        assert_eq!(parse_command("/frobnicate"), Ok(Command::Unknown("frobnicate".to_string())));
    }

    #[test]
    fn incomplete_commands_yield_usage() {
        assert_eq!(parse_command("/explain"), Err(PromptKind::Explain.usage()));
        assert_eq!(parse_command("/note economics9"), Err(PromptKind::Note.usage()));
        assert!(parse_command("/answer q1 ../secrets")
            .unwrap_err()
            .starts_with(&PromptKind::AnswerExercise.usage()));
    }

    #[test]
    fn catalog_parses_display_names() {
        assert_eq!(
            parse_textbook_catalog("economics9=Economics G9, history9 ,,=x"),
            vec![
                ("economics9".to_string(), "Economics G9".to_string()),
                ("history9".to_string(), "history9".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn explain_grounds_prompt_in_matching_pages() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("Prices go up."), false, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/explain inflation economics9"))
            .await?;

        let prompts = tutor.generator().prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("pages 2, 3 of the textbook 'economics9'"));
        assert!(prompts[0].contains("Inflation is a general rise in prices."));

        let replies = tutor.messenger().sent_to(&Recipient::Id(STUDENT));
        assert_eq!(replies, vec!["Prices go up.\n\n(Pages: 2, 3)".to_string()]);

        let keyboards = tutor
            .messenger()
            .outbound()
            .into_iter()
            .filter(|item| matches!(item, Outbound::Keyboard(to, _, _) if *to == Recipient::Id(ADMIN)))
            .count();
        assert_eq!(keyboards, 1);
        assert_eq!(tutor.approvals().pending_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_textbook_falls_back_to_general_knowledge() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("Gravity pulls."), false, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/note gravity physics9"))
            .await?;

        let prompts = tutor.generator().prompts.lock().unwrap().clone();
        assert!(prompts[0].contains("general knowledge"));
        assert_eq!(
            tutor.messenger().sent_to(&Recipient::Id(STUDENT)),
            vec!["Gravity pulls.\n\n(Textbook page not found)".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn answer_uses_exercise_window() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("Because money loses value."), false, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/answer Question 3.2 economics9"))
            .await?;

        let prompts = tutor.generator().prompts.lock().unwrap().clone();
        assert!(prompts[0].contains("Part I: Question 3.2 Explain inflation."));
        assert!(tutor.messenger().sent_to(&Recipient::Id(STUDENT))[0]
            .ends_with("(Source: textbook 'economics9')"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_command_never_reaches_the_generator() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("unused"), false, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/explain economics9"))
            .await?;

        assert!(tutor.generator().prompts.lock().unwrap().is_empty());
        assert_eq!(
            tutor.messenger().sent_to(&Recipient::Id(STUDENT)),
            vec![PromptKind::Explain.usage()]
        );
        assert_eq!(tutor.approvals().pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn generation_failure_becomes_an_apology() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(FakeGenerator::default(), false, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/explain inflation economics9"))
            .await?;

        let replies = tutor.messenger().sent_to(&Recipient::Id(STUDENT));
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Oops! Something went wrong with the AI"));
        assert!(replies[0].contains("quota exceeded"));
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_users_are_refused() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("unused"), true, FlushPolicy::default())?;

        tutor
            .handle_update(&text_update(42, "almaz", "What is GDP?"))
            .await?;
        tutor
            .handle_update(&text_update(42, "almaz", "/explain gdp economics9"))
            .await?;
        tutor
            .handle_update(&text_update(42, "almaz", "/get_my_info"))
            .await?;

        let replies = tutor.messenger().sent_to(&Recipient::Id(42));
        assert_eq!(replies.len(), 3);
        assert!(replies[0].starts_with("You are not allowed to use this bot."));
        assert!(replies[1].starts_with("You are not allowed to use this bot."));
        assert_eq!(replies[2], "your telegram id is: `42`");
        assert!(tutor.generator().prompts.lock().unwrap().is_empty());
        assert!(tutor.generator().chats.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn chat_text_is_streamed_with_send_then_edit() -> Result<(), Box<dyn std::error::Error>> {
        let generator = FakeGenerator {
            fragments: vec![Ok("Hello ".to_string()), Ok("world".to_string())],
            ..FakeGenerator::default()
        };
        let flush = FlushPolicy {
            max_chars: 5,
            max_interval: Duration::from_secs(60),
        };
        let (_dir, mut tutor) = service(generator, true, flush)?;

        tutor.handle_update(&text_update(STUDENT, "abebe", "Hi")).await?;

        let student = Recipient::Id(STUDENT);
        let outbound = tutor.messenger().outbound();
        assert_eq!(outbound[0], Outbound::Send(student.clone(), "Hello ".to_string()));
        assert_eq!(
            outbound[1],
            Outbound::Edit(student, 1, "Hello world".to_string())
        );
        assert!(matches!(&outbound[2], Outbound::Keyboard(to, text, _)
            if *to == Recipient::Id(ADMIN) && text.contains("Reply: Hello world")));
        Ok(())
    }

    #[tokio::test]
    async fn stream_error_is_appended_as_apology() -> Result<(), Box<dyn std::error::Error>> {
        let generator = FakeGenerator {
            fragments: vec![Ok("Partial".to_string()), Err("connection reset".to_string())],
            ..FakeGenerator::default()
        };
        let (_dir, mut tutor) = service(generator, false, FlushPolicy::default())?;

        tutor.handle_update(&text_update(STUDENT, "abebe", "Hi")).await?;

        let replies = tutor.messenger().sent_to(&Recipient::Id(STUDENT));
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Partial\n\nOops!"));
        assert!(replies[0].contains("connection reset"));
        assert_eq!(tutor.history().history_length(STUDENT), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stream_continues_in_a_new_message_past_the_limit() -> Result<(), Box<dyn std::error::Error>> {
        let config = TutorConfig {
            flush: FlushPolicy {
                max_chars: 1,
                max_interval: Duration::from_secs(60),
            },
            message_limit: 8,
            ..TutorConfig::default()
        };
        let (_dir, mut tutor) = service_with(
            streaming(&["abcd", "efg", "hij"]),
            FakeMessenger::default(),
            false,
            config,
        )?;

        tutor.handle_update(&text_update(STUDENT, "abebe", "Hi")).await?;

        let student = Recipient::Id(STUDENT);
        let outbound = tutor.messenger().outbound();
        assert_eq!(
            outbound[..3],
            [
                Outbound::Send(student.clone(), "abcd".to_string()),
                Outbound::Edit(student.clone(), 1, "abcdefg".to_string()),
                Outbound::Send(student, "hij".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_stream_is_flushed_on_the_interval() -> Result<(), Box<dyn std::error::Error>> {
        let generator = FakeGenerator {
            delays: vec![Duration::ZERO, Duration::from_millis(2500)],
            ..streaming(&["Hello ", "world"])
        };
        let flush = FlushPolicy {
            max_chars: 1000,
            max_interval: Duration::from_secs(1),
        };
        let (_dir, mut tutor) = service(generator, false, flush)?;
        let started = tokio::time::Instant::now();

        tutor.handle_update(&text_update(STUDENT, "abebe", "Hi")).await?;

        let student = Recipient::Id(STUDENT);
        let outbound = tutor.messenger().outbound();
        assert_eq!(outbound[0], Outbound::Send(student.clone(), "Hello ".to_string()));
        assert_eq!(
            outbound[1],
            Outbound::Edit(student, 1, "Hello world".to_string())
        );
        assert!(started.elapsed() >= Duration::from_millis(2500));
        Ok(())
    }

    #[tokio::test]
    async fn chat_keeps_history_until_new() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(streaming(&["Sure."]), false, FlushPolicy::default())?;

        for text in ["Hi", "More", "Again"] {
            tutor.handle_update(&text_update(STUDENT, "abebe", text)).await?;
        }

        let chats = tutor.generator().chats.lock().unwrap().clone();
        assert_eq!(chats[0], vec![ChatTurn::user("Hi")]);
        assert_eq!(
            chats[1],
            vec![ChatTurn::user("Hi"), ChatTurn::model("Sure."), ChatTurn::user("More")]
        );
        assert_eq!(chats[2].len(), 5);
        assert_eq!(chats[2][3].role, Role::Model);
        assert_eq!(tutor.history().history_length(STUDENT), 6);

        let student = Recipient::Id(STUDENT);
        let edits = tutor
            .messenger()
            .outbound()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Edit(to, _, text) if to == student => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(edits, vec![format!("Sure.{NEW_CHAT_HINT}")]);

        tutor.handle_update(&text_update(STUDENT, "abebe", "/new")).await?;
        tutor.handle_update(&text_update(STUDENT, "abebe", "Fresh")).await?;

        assert!(tutor
            .messenger()
            .sent_to(&student)
            .contains(&NEW_CHAT_STARTED.to_string()));
        let chats = tutor.generator().chats.lock().unwrap().clone();
        assert_eq!(chats[3], vec![ChatTurn::user("Fresh")]);
        assert_eq!(tutor.history().history_length(STUDENT), 2);
        Ok(())
    }

    #[tokio::test]
    async fn photo_is_answered_from_the_largest_size() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("It shows a demand curve."), false, FlushPolicy::default())?;

        tutor
            .handle_update(&photo_update(STUDENT, Some("What does this graph show?")))
            .await?;
        tutor.handle_update(&photo_update(STUDENT, None)).await?;

        let images = tutor.generator().images.lock().unwrap().clone();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].0, "What does this graph show?");
        assert_eq!(images[0].1, b"jpeg:large".to_vec());
        assert_eq!(images[1].0, DEFAULT_PHOTO_PROMPT);

        let outbound = tutor.messenger().outbound();
        assert!(outbound.contains(&Outbound::Download("large".to_string())));
        assert!(!outbound.contains(&Outbound::Download("small".to_string())));
        assert_eq!(
            tutor.messenger().sent_to(&Recipient::Id(STUDENT)),
            vec!["It shows a demand curve.".to_string(); 2]
        );
        assert!(outbound.iter().any(|item| matches!(item, Outbound::Keyboard(to, text, _)
            if *to == Recipient::Id(ADMIN)
                && text.contains("Photo received:\nCaption: What does this graph show?\nReply: It shows a demand curve."))));
        assert_eq!(tutor.approvals().pending_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_photo_download_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let messenger = FakeMessenger {
            broken_downloads: true,
            ..FakeMessenger::default()
        };
        let (_dir, mut tutor) = service_with(
            answering("unused"),
            messenger,
            false,
            TutorConfig::default(),
        )?;

        tutor.handle_update(&photo_update(STUDENT, Some("Solve it"))).await?;

        assert!(tutor.generator().images.lock().unwrap().is_empty());
        assert_eq!(
            tutor.messenger().sent_to(&Recipient::Id(STUDENT)),
            vec![PHOTO_DOWNLOAD_FAILED.to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_photo_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let mut update = photo_update(42, Some("Solve it"));
        if let Some(message) = update.message.as_mut() {
            message.from = Some(User {
                id: 42,
                username: Some("almaz".to_string()),
            });
        }
        let (_dir, mut tutor) = service(answering("unused"), true, FlushPolicy::default())?;

        tutor.handle_update(&update).await?;

        assert!(!tutor
            .messenger()
            .outbound()
            .iter()
            .any(|item| matches!(item, Outbound::Download(_))));
        assert!(tutor.messenger().sent_to(&Recipient::Id(42))[0]
            .starts_with("You are not allowed to use this bot."));
        Ok(())
    }

    #[tokio::test]
    async fn admin_forwards_pending_post_once() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("Prices go up."), false, FlushPolicy::default())?;
        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/explain inflation economics9"))
            .await?;

        tutor.handle_update(&callback_update(STUDENT, "forward:1")).await?;
        assert!(tutor.messenger().sent_to(&channel()).is_empty());

        tutor.handle_update(&callback_update(ADMIN, "forward:1")).await?;
        tutor.handle_update(&callback_update(ADMIN, "forward:1")).await?;

        let posted = tutor.messenger().sent_to(&channel());
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("Prices go up."));
        assert_eq!(
            tutor.messenger().sent_to(&Recipient::Id(ADMIN)),
            vec![
                "Message forwarded to the channel.".to_string(),
                "This post was already handled.".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn admin_can_decline_a_post() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("Prices go up."), false, FlushPolicy::default())?;
        tutor
            .handle_update(&text_update(STUDENT, "abebe", "/explain inflation economics9"))
            .await?;

        tutor.handle_update(&callback_update(ADMIN, "cancel:1")).await?;

        assert!(tutor.messenger().sent_to(&channel()).is_empty());
        assert_eq!(tutor.approvals().pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn admin_commands_check_identity_and_debug_mode() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("unused"), true, FlushPolicy::default())?;

        assert_eq!(tutor.execute_command(STUDENT, true, "/get_allowed_users").await, ADMIN_ONLY);
        assert_eq!(tutor.execute_command(ADMIN, true, "/get_allowed_users").await, DEBUG_ONLY);
        assert_eq!(
            tutor.execute_command(ADMIN, true, "/pending").await,
            "0 post(s) waiting for approval."
        );
        Ok(())
    }

    #[tokio::test]
    async fn textbook_listing_reports_index_state() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, mut tutor) = service(answering("unused"), false, FlushPolicy::default())?;

        let listing = tutor.execute_command(STUDENT, true, "/textbooks").await;

        assert!(listing.contains("economics9 - Economics G9 (3 pages)"));
        assert!(listing.contains("history9 - History G9 (not indexed yet)"));
        Ok(())
    }
}
