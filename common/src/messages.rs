//! Conversation turns as exchanged with the backend.

use serde::{Deserialize, Serialize};

/// A single `(role, content)` turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Ordered conversation. Order is conversation order; duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageSequence(Vec<Message>);

impl MessageSequence {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.0.push(Message::new(role, content));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.0.last()
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|m| m.role.as_str())
    }

    pub fn contents(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|m| m.content.as_str())
    }

    pub fn into_inner(self) -> Vec<Message> {
        self.0
    }
}

impl From<Vec<Message>> for MessageSequence {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl FromIterator<Message> for MessageSequence {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a MessageSequence {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Bounds applied when reading a conversation back out of native memory.
///
/// The caller pre-allocates `max_turn_count × max_string_length` bytes per
/// column; the backend fills them in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceLimits {
    pub max_turn_count: usize,
    /// Slot size in bytes, including the terminating NUL
    pub max_string_length: usize,
}

impl Default for SequenceLimits {
    fn default() -> Self {
        Self {
            max_turn_count: 64,
            max_string_length: 4096,
        }
    }
}

impl SequenceLimits {
    /// Bytes needed for one column (roles or contents).
    pub fn column_bytes(&self) -> Option<usize> {
        self.max_turn_count.checked_mul(self.max_string_length)
    }
}
