use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One piece of a turn, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fragment {
    Text { text: String },
    /// Audio is summarised, never retained
    Audio { bytes: usize, duration_ms: u64 },
}

/// A finalized utterance attributed to one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    /// Position in the conversation (assigned when logged)
    pub sequence: u64,
    pub role: Role,
    pub fragments: Vec<Fragment>,
    pub complete: bool,
    /// Cut short by an interruption
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// Concatenated text fragments
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Text { text } => Some(text.as_str()),
                Fragment::Audio { .. } => None,
            })
            .collect()
    }

    /// Total audio duration in milliseconds
    pub fn audio_ms(&self) -> u64 {
        self.fragments
            .iter()
            .map(|f| match f {
                Fragment::Audio { duration_ms, .. } => *duration_ms,
                Fragment::Text { .. } => 0,
            })
            .sum()
    }
}

/// A turn still receiving fragments
#[derive(Debug)]
pub(crate) struct OpenTurn {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) started_at: DateTime<Utc>,
    /// At least one transcript delta/final text has been appended
    pub(crate) has_text: bool,
    /// The final transcript has arrived
    pub(crate) transcript_done: bool,
    /// Audio is over; only the transcript is outstanding
    pub(crate) awaiting_transcript: bool,
}

impl OpenTurn {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            fragments: Vec::new(),
            started_at: Utc::now(),
            has_text: false,
            transcript_done: false,
            awaiting_transcript: false,
        }
    }

    pub(crate) fn push_text(&mut self, text: &str) {
        self.has_text = true;
        if text.is_empty() {
            return;
        }
        match self.fragments.last_mut() {
            Some(Fragment::Text { text: last }) => last.push_str(text),
            _ => self.fragments.push(Fragment::Text {
                text: text.to_string(),
            }),
        }
    }

    /// Consecutive audio is coalesced into one fragment
    pub(crate) fn push_audio(&mut self, bytes: usize, duration_ms: u64) {
        match self.fragments.last_mut() {
            Some(Fragment::Audio {
                bytes: total_bytes,
                duration_ms: total_ms,
            }) => {
                *total_bytes += bytes;
                *total_ms += duration_ms;
            }
            _ => self.fragments.push(Fragment::Audio { bytes, duration_ms }),
        }
    }

    pub(crate) fn finish(self, truncated: bool) -> Turn {
        Turn {
            id: self.id,
            sequence: 0,
            role: self.role,
            fragments: self.fragments,
            complete: true,
            truncated,
            started_at: self.started_at,
            completed_at: Some(Utc::now()),
        }
    }
}
