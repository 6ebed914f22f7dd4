use super::backend::AudioFrame;

/// Splits an arbitrary sample stream into fixed-size frames
///
/// Timestamps are derived from the number of samples emitted, so frames
/// advance at the nominal rate regardless of how input buffers arrive.
#[derive(Debug)]
pub struct Framer {
    samples_per_frame: usize,
    sample_rate: u32,
    pending: Vec<i16>,
    sequence: u64,
    samples_emitted: u64,
}

impl Framer {
    pub fn new(sample_rate: u32, samples_per_frame: usize) -> Self {
        Self {
            samples_per_frame: samples_per_frame.max(1),
            sample_rate,
            pending: Vec::with_capacity(samples_per_frame),
            sequence: 0,
            samples_emitted: 0,
        }
    }

    /// Buffer samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.samples_per_frame {
            let rest = self.pending.split_off(self.samples_per_frame);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(self.emit(samples));
        }
        frames
    }

    /// Emit the partial frame (zero padded), if any
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(self.samples_per_frame, 0);
        Some(self.emit(samples))
    }

    /// Start a new run: sequence and clock restart at zero
    pub fn reset(&mut self) {
        self.pending.clear();
        self.sequence = 0;
        self.samples_emitted = 0;
    }

    fn emit(&mut self, samples: Vec<i16>) -> AudioFrame {
        let timestamp_ms = if self.sample_rate == 0 {
            0
        } else {
            self.samples_emitted * 1000 / self.sample_rate as u64
        };

        self.samples_emitted += samples.len() as u64;
        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            sequence: self.sequence,
            timestamp_ms,
        };
        self.sequence += 1;
        frame
    }
}
