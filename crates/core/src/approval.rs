use std::collections::BTreeMap;
use tracing::{info, warn};

pub const DEFAULT_PENDING_LIMIT: usize = 100;

/// A reply waiting for the admin to decide whether it goes to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPost {
    pub id: u64,
    pub author_id: i64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Cancel,
}

impl Decision {
    fn prefix(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Cancel => "cancel",
        }
    }

    pub fn callback_data(self, id: u64) -> String {
        format!("{}:{id}", self.prefix())
    }

    /// `"forward:12"` -> `(Forward, 12)`.
    pub fn parse_callback(data: &str) -> Option<(Self, u64)> {
        let (action, id) = data.split_once(':')?;
        let decision = match action {
            "forward" => Self::Forward,
            "cancel" => Self::Cancel,
            _ => return None,
        };
        Some((decision, id.trim().parse().ok()?))
    }
}

/// Pending posts keyed by a monotonically increasing id. Each id resolves once.
///
/// At most `limit` posts wait at a time; submitting past the limit drops the
/// oldest pending post, which then answers as already handled.
#[derive(Debug)]
pub struct ApprovalQueue {
    next_id: u64,
    limit: usize,
    pending: BTreeMap<u64, PendingPost>,
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::with_limit(DEFAULT_PENDING_LIMIT)
    }
}

impl ApprovalQueue {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            next_id: 0,
            limit: limit.max(1),
            pending: BTreeMap::new(),
        }
    }

    pub fn submit(&mut self, author_id: i64, text: impl Into<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingPost {
                id,
                author_id,
                text: text.into(),
            },
        );
        info!(id, author_id, "post queued for approval");

        while self.pending.len() > self.limit {
            if let Some((dropped, _)) = self.pending.pop_first() {
                warn!(id = dropped, limit = self.limit, "oldest pending post dropped");
            }
        }
        id
    }

    pub fn resolve(&mut self, id: u64) -> Option<PendingPost> {
        self.pending.remove(&id)
    }

    pub fn approve(&mut self, id: u64) -> Option<PendingPost> {
        self.resolve(id)
    }

    pub fn deny(&mut self, id: u64) -> Option<PendingPost> {
        self.resolve(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
