//! Bounded rolling conversation history

use std::collections::VecDeque;

/// Maximum retained turns (3 user/assistant exchanges)
pub const MAX_TURNS: usize = 6;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The person talking to the character
    User,
    /// The character
    Assistant,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Speaker of this turn
    pub role: Role,
    /// What was said
    pub content: String,
}

/// Ordered rolling window of conversation turns.
///
/// Each conversational driver (control handler, auto-loop) owns its own
/// instance; instances are never shared across tasks.
#[derive(Debug, Default, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
}

impl ConversationHistory {
    /// Empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a user turn
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    /// Append an assistant turn
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content.into());
    }

    fn push(&mut self, role: Role, content: String) {
        self.turns.push_back(Turn { role, content });
        while self.turns.len() > MAX_TURNS {
            self.turns.pop_front();
        }
    }

    /// Most recent user turn, if any
    #[must_use]
    pub fn last_user(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
    }

    /// Number of retained turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Iterate turns oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_to_six_turns_after_any_append() {
        let mut history = ConversationHistory::new();
        for i in 0..20 {
            history.push_user(format!("question {i}"));
            assert!(history.len() <= MAX_TURNS);
            history.push_assistant(format!("answer {i}"));
            assert!(history.len() <= MAX_TURNS);
        }
        assert_eq!(history.len(), MAX_TURNS);
    }

    #[test]
    fn drops_oldest_first() {
        let mut history = ConversationHistory::new();
        for i in 0..8 {
            history.push_user(format!("turn {i}"));
        }
        let contents: Vec<_> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            ["turn 2", "turn 3", "turn 4", "turn 5", "turn 6", "turn 7"]
        );
    }

    #[test]
    fn last_user_skips_assistant_turns() {
        let mut history = ConversationHistory::new();
        assert_eq!(history.last_user(), None);

        history.push_user("hello bird");
        history.push_assistant("squawk hello");
        assert_eq!(history.last_user(), Some("hello bird"));

        history.push_user("how are you");
        assert_eq!(history.last_user(), Some("how are you"));
    }
}
