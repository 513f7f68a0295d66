//! UI-agnostic conversation state
//!
//! This module contains the data structures shared by every front end and the
//! reducers that fold decoded answer text into them. Reducers never mutate in
//! place: each update produces the next value, so a view holding an older
//! snapshot is never changed underneath it.

use serde::{Deserialize, Serialize};

/// Prefix for failures shown in place of an answer.
pub const ERROR_PREFIX: &str = "Error: ";

/// Identifies one question/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(pub u64);

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A chat message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub exchange: ExchangeId,
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    User,
    Assistant,
}

/// One step of an exchange, as produced by the decoder or the buffered path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// More streamed answer text.
    Fragment(String),
    /// The whole answer, delivered at once.
    Complete(String),
    /// The exchange failed with this message.
    Failed(String),
}

/// Conversation state that can absorb exchange updates.
pub trait Transcript: Clone + Default {
    /// State after a question has been submitted.
    fn begin(&self, exchange: ExchangeId, question: &str) -> Self;

    /// State after one update of `exchange`.
    fn apply(&self, exchange: ExchangeId, update: &Update) -> Self;

    /// The answer text currently displayed for the latest exchange.
    fn answer(&self) -> Option<&str>;
}

/// Multi-turn conversation: an ordered list of user and assistant turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    fn pushed(&self, message: ChatMessage) -> Self {
        let mut messages = self.messages.clone();
        messages.push(message);
        Self { messages }
    }

    /// Index of the assistant turn answering `exchange`, if it is the last turn.
    fn open_answer(&self, exchange: ExchangeId) -> Option<usize> {
        let last = self.messages.len().checked_sub(1)?;
        let msg = &self.messages[last];
        (msg.role == ChatRole::Assistant && msg.exchange == exchange).then_some(last)
    }

    /// Replace or extend the answer turn for `exchange`.
    fn with_answer(&self, exchange: ExchangeId, content: impl FnOnce(&str) -> String) -> Self {
        match self.open_answer(exchange) {
            Some(idx) => {
                let mut messages = self.messages.clone();
                messages[idx] = ChatMessage {
                    role: ChatRole::Assistant,
                    content: content(&self.messages[idx].content),
                    exchange,
                };
                Self { messages }
            }
            None => self.pushed(ChatMessage {
                role: ChatRole::Assistant,
                content: content(""),
                exchange,
            }),
        }
    }
}

impl Transcript for Conversation {
    fn begin(&self, exchange: ExchangeId, question: &str) -> Self {
        self.pushed(ChatMessage {
            role: ChatRole::User,
            content: question.to_string(),
            exchange,
        })
    }

    fn apply(&self, exchange: ExchangeId, update: &Update) -> Self {
        match update {
            Update::Fragment(text) => self.with_answer(exchange, |old| format!("{}{}", old, text)),
            Update::Complete(text) => self.with_answer(exchange, |_| text.clone()),
            Update::Failed(message) => {
                self.with_answer(exchange, |_| format!("{}{}", ERROR_PREFIX, message))
            }
        }
    }

    fn answer(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Single-response mode: one answer string, reset for every exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningAnswer {
    exchange: Option<ExchangeId>,
    text: String,
}

impl RunningAnswer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Transcript for RunningAnswer {
    fn begin(&self, exchange: ExchangeId, _question: &str) -> Self {
        Self {
            exchange: Some(exchange),
            text: String::new(),
        }
    }

    fn apply(&self, exchange: ExchangeId, update: &Update) -> Self {
        if self.exchange != Some(exchange) {
            return self.clone();
        }
        let text = match update {
            Update::Fragment(fragment) => format!("{}{}", self.text, fragment),
            Update::Complete(text) => text.clone(),
            Update::Failed(message) => format!("{}{}", ERROR_PREFIX, message),
        };
        Self {
            exchange: self.exchange,
            text,
        }
    }

    fn answer(&self) -> Option<&str> {
        self.exchange.map(|_| self.text.as_str())
    }
}
