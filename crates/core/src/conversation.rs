use crate::traits::ChatTurn;
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_MAX_TURNS: usize = 40;

/// One user's running conversation, alternating user and model turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
}

impl Conversation {
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The history followed by the new question, ready for the generator.
    pub fn with_question(&self, question: &str) -> Vec<ChatTurn> {
        let mut turns = self.turns.clone();
        turns.push(ChatTurn::user(question));
        turns
    }

    /// Stores a finished exchange. The oldest exchanges go first once the
    /// history holds more than `max_turns` turns.
    pub fn record(&mut self, question: &str, answer: &str, max_turns: usize) {
        self.turns.push(ChatTurn::user(question));
        self.turns.push(ChatTurn::model(answer));

        if self.turns.len() > max_turns {
            let excess = self.turns.len() - max_turns;
            let dropped = (excess + excess % 2).min(self.turns.len());
            self.turns.drain(..dropped);
        }
    }
}

/// Conversations keyed by user id.
#[derive(Debug)]
pub struct ChatHistory {
    chats: HashMap<i64, Conversation>,
    max_turns: usize,
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::with_max_turns(DEFAULT_MAX_TURNS)
    }
}

impl ChatHistory {
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            chats: HashMap::new(),
            max_turns: max_turns.max(2),
        }
    }

    pub fn conversation(&self, user_id: i64) -> Option<&Conversation> {
        self.chats.get(&user_id)
    }

    pub fn history_length(&self, user_id: i64) -> usize {
        self.chats.get(&user_id).map_or(0, Conversation::len)
    }

    pub fn turns_for(&self, user_id: i64, question: &str) -> Vec<ChatTurn> {
        match self.chats.get(&user_id) {
            Some(conversation) => conversation.with_question(question),
            None => vec![ChatTurn::user(question)],
        }
    }

    /// Returns the history length after the exchange.
    pub fn record(&mut self, user_id: i64, question: &str, answer: &str) -> usize {
        let conversation = self.chats.entry(user_id).or_default();
        conversation.record(question, answer, self.max_turns);
        debug!(user_id, turns = conversation.len(), "exchange recorded");
        conversation.len()
    }

    /// Forgets the user's conversation. `false` when there was none.
    pub fn reset(&mut self, user_id: i64) -> bool {
        self.chats.remove(&user_id).is_some()
    }
}
