use serde::{Deserialize, Serialize};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single entry of the conversation, serialized as `{"role": ..., "content": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered conversation history.
///
/// Append-only, except that the trailing assistant message may have its
/// content replaced while a reply is streaming in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user_message(&mut self, message: &str) {
        self.messages.push(ChatMessage::user(message));
    }

    pub fn add_assistant_message(&mut self, message: &str) {
        self.messages.push(ChatMessage::assistant(message));
    }

    /// Append-or-replace-last for a streaming reply.
    ///
    /// If the last message is the assistant's, its content becomes `content`;
    /// otherwise a new assistant message is appended.
    pub fn upsert_assistant_message(&mut self, content: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content.clear();
                last.content.push_str(content);
            }
            _ => self.add_assistant_message(content),
        }
    }

    pub fn get_messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
