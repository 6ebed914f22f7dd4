use super::model::Turn;

/// Ordered turns of one session: stored history followed by live turns
///
/// Append-only. The log assigns each live turn the next sequence number
/// after the history it was loaded with.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    session_id: String,
    turns: Vec<Turn>,
    history_len: usize,
    next_sequence: u64,
}

impl ConversationLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_history(session_id, Vec::new())
    }

    pub fn with_history(session_id: impl Into<String>, mut history: Vec<Turn>) -> Self {
        history.sort_by_key(|turn| turn.sequence);
        let next_sequence = history.last().map(|turn| turn.sequence + 1).unwrap_or(0);

        Self {
            session_id: session_id.into(),
            history_len: history.len(),
            turns: history,
            next_sequence,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a finalized turn; returns it with its sequence assigned
    pub fn append(&mut self, mut turn: Turn) -> Turn {
        turn.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.turns.push(turn.clone());
        turn
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Turns loaded from the store when the log was created
    pub fn history(&self) -> &[Turn] {
        &self.turns[..self.history_len]
    }

    /// Turns finalized during this session
    pub fn live_turns(&self) -> &[Turn] {
        &self.turns[self.history_len..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
