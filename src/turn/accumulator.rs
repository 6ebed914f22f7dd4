use tracing::{debug, warn};

use super::model::{OpenTurn, Role, Turn};
use crate::transport::StreamEvent;

/// Assembles streamed fragments into turns
///
/// Holds at most one open turn per role. Model output maps to the assistant;
/// locally captured audio and its transcription map to the user.
#[derive(Debug)]
pub struct TurnAccumulator {
    sample_rate: u32,
    user: Option<OpenTurn>,
    assistant: Option<OpenTurn>,
    /// The last assistant turn closed on `AudioDone`; its trailing
    /// transcript final carries nothing new
    absorb_final: bool,
    /// User turns finalized before their transcript arrived; that many
    /// user transcripts still in flight belong to them, not the open turn
    late_user_finals: usize,
}

impl TurnAccumulator {
    /// `sample_rate` is the rate of inbound assistant audio
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            user: None,
            assistant: None,
            absorb_final: false,
            late_user_finals: 0,
        }
    }

    pub fn has_open(&self, role: Role) -> bool {
        self.slot_ref(role).is_some()
    }

    /// Apply one inbound event; returns the turn it completed, if any
    pub fn ingest(&mut self, event: &StreamEvent) -> Option<Turn> {
        match event {
            StreamEvent::TranscriptDelta { role, text } => {
                if *role == Role::User && self.late_user_finals > 0 {
                    debug!("Dropping transcript delta of an already finalized user turn");
                    return None;
                }
                let turn = self.open(*role);
                if turn.transcript_done {
                    debug!("Ignoring {:?} transcript delta after final", role);
                } else {
                    turn.push_text(text);
                }
                None
            }
            StreamEvent::TranscriptFinal { role, text } => self.transcript_final(*role, text),
            StreamEvent::AudioDelta { bytes } => {
                let duration_ms = self.audio_duration_ms(bytes.len());
                self.open(Role::Assistant).push_audio(bytes.len(), duration_ms);
                None
            }
            StreamEvent::AudioDone => {
                let turn = self.assistant.take()?;
                self.absorb_final = !turn.transcript_done;
                Some(turn.finish(false))
            }
            StreamEvent::Interrupted => self.interrupt(),
            StreamEvent::SessionConfirmed
            | StreamEvent::SpeechStarted
            | StreamEvent::SpeechStopped
            | StreamEvent::Error { .. } => None,
        }
    }

    /// Open a user turn for a new local utterance
    ///
    /// A previous user turn still waiting for its transcript is finalized
    /// first and returned.
    pub fn begin_user_turn(&mut self) -> Option<Turn> {
        let previous = match self.user.take() {
            Some(turn) if turn.awaiting_transcript => {
                debug!("Finalizing user turn without transcript");
                self.late_user_finals += 1;
                Some(turn.finish(false))
            }
            Some(turn) => {
                warn!("User turn already open, continuing it");
                self.user = Some(turn);
                return None;
            }
            None => None,
        };

        self.user = Some(OpenTurn::new(Role::User));
        previous
    }

    /// Record captured audio on the open user turn
    pub fn append_user_audio(&mut self, bytes: usize, duration_ms: u64) {
        if let Some(turn) = self.user.as_mut() {
            if !turn.awaiting_transcript {
                turn.push_audio(bytes, duration_ms);
            }
        }
    }

    /// The local utterance ended
    ///
    /// Finalizes the user turn now, unless `await_transcript` is set and the
    /// transcript has not arrived yet; then the turn completes on its
    /// `TranscriptFinal`.
    pub fn end_user_speech(&mut self, await_transcript: bool) -> Option<Turn> {
        let mut turn = self.user.take()?;
        if await_transcript && !turn.transcript_done {
            turn.awaiting_transcript = true;
            self.user = Some(turn);
            return None;
        }
        Some(turn.finish(false))
    }

    /// Finalize the in-flight assistant turn early, marked truncated
    pub fn interrupt(&mut self) -> Option<Turn> {
        self.absorb_final = false;
        self.assistant.take().map(|turn| {
            debug!("Assistant turn truncated by interruption");
            turn.finish(true)
        })
    }

    /// Drop every open turn (transport lost mid-turn); returns how many
    pub fn discard_open(&mut self) -> usize {
        self.absorb_final = false;
        self.late_user_finals = 0;
        let discarded = self.user.take().is_some() as usize + self.assistant.take().is_some() as usize;
        if discarded > 0 {
            debug!("Discarded {} open turn(s)", discarded);
        }
        discarded
    }

    fn transcript_final(&mut self, role: Role, text: &str) -> Option<Turn> {
        // Transcripts arrive in utterance order
        if role == Role::User && self.late_user_finals > 0 {
            self.late_user_finals -= 1;
            debug!("Dropping late transcript of an already finalized user turn");
            return None;
        }

        let Some(mut turn) = self.slot(role).take() else {
            if role == Role::Assistant && std::mem::take(&mut self.absorb_final) {
                return None;
            }
            if text.is_empty() {
                return None;
            }
            // Final without any earlier fragments: a complete turn on its own
            let mut turn = OpenTurn::new(role);
            turn.push_text(text);
            return Some(turn.finish(false));
        };

        if !turn.has_text {
            turn.push_text(text);
        }
        turn.transcript_done = true;

        // A user turn still capturing audio completes when the speech ends
        if role == Role::User && !turn.awaiting_transcript {
            self.user = Some(turn);
            return None;
        }

        Some(turn.finish(false))
    }

    fn open(&mut self, role: Role) -> &mut OpenTurn {
        if role == Role::Assistant && self.assistant.is_none() {
            self.absorb_final = false;
        }
        self.slot(role).get_or_insert_with(|| OpenTurn::new(role))
    }

    fn slot(&mut self, role: Role) -> &mut Option<OpenTurn> {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    fn slot_ref(&self, role: Role) -> Option<&OpenTurn> {
        match role {
            Role::User => self.user.as_ref(),
            Role::Assistant => self.assistant.as_ref(),
        }
    }

    fn audio_duration_ms(&self, bytes: usize) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (bytes as u64 / 2) * 1000 / self.sample_rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::Fragment;

    fn delta(role: Role, text: &str) -> StreamEvent {
        StreamEvent::TranscriptDelta {
            role,
            text: text.to_string(),
        }
    }

    fn done(role: Role, text: &str) -> StreamEvent {
        StreamEvent::TranscriptFinal {
            role,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_deltas_then_final_yield_one_turn() {
        let mut acc = TurnAccumulator::new(24_000);
        let parts = ["The ", "quick ", "brown ", "fox"];
        for part in parts {
            assert!(acc.ingest(&delta(Role::Assistant, part)).is_none());
        }

        let turn = acc.ingest(&done(Role::Assistant, "ignored")).unwrap();
        assert_eq!(turn.text(), parts.concat());
        assert_eq!(turn.role, Role::Assistant);
        assert!(turn.complete);
        assert!(!turn.truncated);
        assert!(!acc.has_open(Role::Assistant));
    }

    #[test]
    fn test_final_without_deltas_uses_final_text() {
        let mut acc = TurnAccumulator::new(24_000);
        let turn = acc.ingest(&done(Role::Assistant, "Hi.")).unwrap();
        assert_eq!(turn.text(), "Hi.");
    }

    #[test]
    fn test_audio_done_closes_assistant_turn() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.ingest(&StreamEvent::AudioDelta { bytes: vec![0; 960] });
        acc.ingest(&delta(Role::Assistant, "Sure"));
        acc.ingest(&StreamEvent::AudioDelta { bytes: vec![0; 960] });

        let turn = acc.ingest(&StreamEvent::AudioDone).unwrap();
        assert_eq!(turn.audio_ms(), 40);
        assert_eq!(turn.text(), "Sure");

        // The trailing transcript final does not open a second turn
        assert!(acc.ingest(&done(Role::Assistant, "Sure")).is_none());
        assert!(!acc.has_open(Role::Assistant));

        // The next response is unaffected
        let next = acc.ingest(&done(Role::Assistant, "Anything else?")).unwrap();
        assert_eq!(next.text(), "Anything else?");
    }

    #[test]
    fn test_interruption_truncates_assistant_turn() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.ingest(&delta(Role::Assistant, "Let me expl"));

        let turn = acc.ingest(&StreamEvent::Interrupted).unwrap();
        assert!(turn.truncated);
        assert!(turn.complete);
        assert_eq!(turn.text(), "Let me expl");

        assert!(acc.ingest(&StreamEvent::Interrupted).is_none());
    }

    #[test]
    fn test_user_turn_without_transcription() {
        let mut acc = TurnAccumulator::new(24_000);
        assert!(acc.begin_user_turn().is_none());
        acc.append_user_audio(960, 20);
        acc.append_user_audio(960, 20);

        let turn = acc.end_user_speech(false).unwrap();
        assert_eq!(turn.role, Role::User);
        assert_eq!(
            turn.fragments,
            vec![Fragment::Audio {
                bytes: 1920,
                duration_ms: 40
            }]
        );
    }

    #[test]
    fn test_user_turn_waits_for_transcript() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.begin_user_turn();
        acc.append_user_audio(960, 20);

        assert!(acc.end_user_speech(true).is_none());
        assert!(acc.has_open(Role::User));

        // Audio after the utterance ended is not attributed to it
        acc.append_user_audio(960, 20);

        acc.ingest(&delta(Role::User, "what time "));
        let turn = acc.ingest(&done(Role::User, "what time is it")).unwrap();
        assert_eq!(turn.text(), "what time ");
        assert_eq!(turn.audio_ms(), 20);
    }

    #[test]
    fn test_transcript_before_speech_end() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.begin_user_turn();
        assert!(acc.ingest(&done(Role::User, "hello")).is_none());

        let turn = acc.end_user_speech(true).unwrap();
        assert_eq!(turn.text(), "hello");
    }

    #[test]
    fn test_new_utterance_finalizes_waiting_turn() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.begin_user_turn();
        acc.end_user_speech(true);

        let previous = acc.begin_user_turn().unwrap();
        assert_eq!(previous.role, Role::User);
        assert!(acc.has_open(Role::User));
    }

    #[test]
    fn test_late_transcript_does_not_leak_into_next_turn() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.begin_user_turn();
        assert!(acc.end_user_speech(true).is_none());

        // Second utterance starts before the first transcript lands
        let first = acc.begin_user_turn().unwrap();
        assert_eq!(first.text(), "");

        assert!(acc.ingest(&delta(Role::User, "fir")).is_none());
        assert!(acc.ingest(&done(Role::User, "first")).is_none());
        assert!(acc.has_open(Role::User));

        assert!(acc.end_user_speech(true).is_none());
        let second = acc.ingest(&done(Role::User, "second")).unwrap();
        assert_eq!(second.role, Role::User);
        assert_eq!(second.text(), "second");
        assert!(!acc.has_open(Role::User));

        // Nothing else is pending
        assert!(acc.begin_user_turn().is_none());
    }

    #[test]
    fn test_discard_open_drops_everything() {
        let mut acc = TurnAccumulator::new(24_000);
        acc.begin_user_turn();
        acc.ingest(&delta(Role::Assistant, "partial"));

        assert_eq!(acc.discard_open(), 2);
        assert!(!acc.has_open(Role::User));
        assert!(!acc.has_open(Role::Assistant));
        assert!(acc.ingest(&StreamEvent::AudioDone).is_none());
    }
}
