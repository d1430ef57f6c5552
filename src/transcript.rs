//! The clarification transcript.
//!
//! Two views share the same content: the ordered display turns (what the
//! user sees, with timestamps) and the machine-facing message sequence fed
//! to the gateway (system/user/assistant, no presentational formatting).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{ChatMessage, Role};

/// Who produced a display turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One exchange entry in the clarification conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered record of the clarification conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            role: TurnRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// The machine-facing message sequence: the given system prompt followed
    /// by the turns as user/assistant messages, stripped of timestamps.
    pub fn as_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        for turn in &self.turns {
            let role = match turn.role {
                TurnRole::User => Role::User,
                TurnRole::Assistant => Role::Assistant,
            };
            messages.push(ChatMessage::new(role, &turn.content));
        }
        messages
    }

    /// Render the conversation as plain text for inclusion in a prompt.
    pub fn as_plain_text(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let label = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Writer",
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&turn.content);
            out.push_str("\n\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_are_ordered() {
        let mut transcript = Transcript::new();
        transcript.push_user("I want a todo app");
        transcript.push_assistant("What platforms?");
        transcript.push_user("Web only");

        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.turns[0].role, TurnRole::User);
        assert_eq!(transcript.turns[1].role, TurnRole::Assistant);
        assert_eq!(transcript.turns[2].content, "Web only");
    }

    #[test]
    fn as_messages_prepends_system_prompt() {
        let mut transcript = Transcript::new();
        transcript.push_user("idea");
        transcript.push_assistant("question?");

        let messages = transcript.as_messages("you are a writer");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "you are a writer");
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].content, "question?");
    }

    #[test]
    fn plain_text_labels_both_sides() {
        let mut transcript = Transcript::new();
        transcript.push_user("hello");
        transcript.push_assistant("hi");

        let text = transcript.as_plain_text();
        assert!(text.contains("User: hello"));
        assert!(text.contains("Writer: hi"));
    }

    #[test]
    fn serde_round_trip() {
        let mut transcript = Transcript::new();
        transcript.push_user("one");
        transcript.push_assistant("two");

        let json = serde_json::to_string(&transcript).unwrap();
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.turns[1].content, "two");
    }
}
