// Format conversion into the wire format (mono, negotiated sample rate)

/// Average interleaved channels down to mono
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels as usize)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Resample a complete buffer in one call
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    Resampler::new(from_rate, to_rate).process(samples)
}

/// Streaming linear-interpolation resampler
///
/// Keeps the last input sample and the fractional read position between
/// calls so consecutive device buffers join without clicks.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    position: f64,
    previous: Option<i16>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };

        Self {
            from_rate,
            to_rate,
            step,
            position: 0.0,
            previous: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }

        let mut source = Vec::with_capacity(input.len() + 1);
        if let Some(previous) = self.previous {
            source.push(previous);
        }
        source.extend_from_slice(input);

        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.position + 1.0 < source.len() as f64 {
            let index = self.position.floor() as usize;
            let frac = self.position - index as f64;
            let a = source[index] as f64;
            let b = source[index + 1] as f64;
            output.push((a + (b - a) * frac).round() as i16);
            self.position += self.step;
        }

        // Re-base so index 0 is the sample carried into the next call
        self.position -= (source.len() - 1) as f64;
        self.previous = source.last().copied();

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo_averages() {
        let stereo = vec![100, 200, -100, -300];
        assert_eq!(downmix(&stereo, 2), vec![150, -200]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_halving_rate_halves_length() {
        let input: Vec<i16> = (0..960).map(|i| i as i16).collect();
        let output = resample(&input, 48_000, 24_000);

        assert_eq!(output.len(), 480);
        assert_eq!(output[0], 0);
        assert_eq!(output[1], 2);
    }

    #[test]
    fn test_streaming_matches_rate_over_many_buffers() {
        let mut resampler = Resampler::new(16_000, 24_000);
        let mut total = 0;
        for _ in 0..100 {
            total += resampler.process(&[0; 160]).len();
        }
        // 1s of 16kHz input yields ~1s of 24kHz output
        assert!((total as i64 - 24_000).abs() <= 2, "got {}", total);
    }

    #[test]
    fn test_upsampling_interpolates() {
        let output = resample(&[0, 100], 12_000, 24_000);
        assert_eq!(output, vec![0, 50]);
    }
}
