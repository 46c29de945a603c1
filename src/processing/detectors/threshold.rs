use crate::config::SpikeConfig;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingDirection {
    Rising,
    Falling,
}

impl CrossingDirection {
    /// Positive thresholds detect upward crossings, negative ones downward
    /// crossings. A zero threshold disables the channel.
    pub fn for_threshold(threshold: f32) -> Option<Self> {
        if threshold > 0.0 {
            Some(CrossingDirection::Rising)
        } else if threshold < 0.0 {
            Some(CrossingDirection::Falling)
        } else {
            None
        }
    }

    #[inline]
    fn beyond(self, sample: f32, threshold: f32) -> bool {
        match self {
            CrossingDirection::Rising => sample >= threshold,
            CrossingDirection::Falling => sample <= threshold,
        }
    }
}

// THRESHOLD CROSSING DETECTOR -------------------------------------------------

/// Sign-based threshold crossing detector shared by live acquisition and
/// offline rescans.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCrossingDetector {
    geometry: SpikeConfig,
}

impl ThresholdCrossingDetector {
    pub fn new(geometry: SpikeConfig) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> SpikeConfig {
        self.geometry
    }

    /// Number of samples in every extracted waveform snippet.
    pub fn snippet_len(&self) -> usize {
        self.geometry.pre_threshold + self.geometry.spike_length + self.geometry.post_threshold
    }

    /// Samples after an event during which no new event may fire.
    pub fn retrigger_guard(&self) -> usize {
        (self.geometry.spike_length + self.geometry.post_threshold).max(1)
    }

    /// Snippet window around a crossing, `None` if it leaves `0..len`.
    pub fn window(&self, position: usize, len: usize) -> Option<Range<usize>> {
        let start = position.checked_sub(self.geometry.pre_threshold)?;
        let end = position + self.geometry.spike_length + self.geometry.post_threshold;
        if end > len {
            return None;
        }
        Some(start..end)
    }

    /// Returns the positions of all crossings whose snippet fits in `samples`,
    /// in ascending order.
    pub fn detect(&self, samples: &[f32], threshold: f32) -> Vec<usize> {
        let mut positions = Vec::new();
        self.detect_into(samples, threshold, &mut positions);
        positions
    }

    pub fn detect_into(&self, samples: &[f32], threshold: f32, positions: &mut Vec<usize>) {
        positions.clear();
        let direction = match CrossingDirection::for_threshold(threshold) {
            Some(direction) => direction,
            None => return,
        };
        let Some(&first) = samples.first() else {
            return;
        };

        let guard = self.retrigger_guard();
        let mut previous_beyond = direction.beyond(first, threshold);
        let mut next_allowed = 0usize;

        for (i, &sample) in samples.iter().enumerate().skip(1) {
            let beyond = direction.beyond(sample, threshold);
            if beyond && !previous_beyond && i >= next_allowed {
                // The event consumes the guard even when its snippet does not fit
                next_allowed = i + guard;
                if self.window(i, samples.len()).is_some() {
                    positions.push(i);
                }
            }
            previous_beyond = beyond;
        }
    }

    /// Waveform snippet for a previously detected position.
    pub fn snippet<'a>(&self, samples: &'a [f32], position: usize) -> Option<&'a [f32]> {
        self.window(position, samples.len()).map(|range| &samples[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ThresholdCrossingDetector {
        ThresholdCrossingDetector::new(SpikeConfig {
            pre_threshold: 5,
            post_threshold: 5,
            spike_length: 10,
        })
    }

    fn pulse_at(len: usize, positions: &[usize], amplitude: f32, width: usize) -> Vec<f32> {
        let mut samples = vec![0.0; len];
        for &p in positions {
            for s in samples.iter_mut().skip(p).take(width) {
                *s = amplitude;
            }
        }
        samples
    }

    #[test]
    fn detects_single_rising_crossing() {
        let samples = pulse_at(200, &[100], 1.0, 3);
        assert_eq!(detector().detect(&samples, 0.5), vec![100]);
    }

    #[test]
    fn negative_threshold_detects_falling_crossing() {
        let samples = pulse_at(200, &[40, 120], -1.0, 2);
        assert_eq!(detector().detect(&samples, -0.5), vec![40, 120]);
        assert!(detector().detect(&samples, 0.5).is_empty());
    }

    #[test]
    fn zero_threshold_disables_detection() {
        let samples = pulse_at(200, &[100], 1.0, 3);
        assert!(detector().detect(&samples, 0.0).is_empty());
    }

    #[test]
    fn one_event_per_excursion() {
        // A long excursion only fires once even after the guard expires
        let samples = pulse_at(200, &[50], 1.0, 80);
        assert_eq!(detector().detect(&samples, 0.5), vec![50]);
    }

    #[test]
    fn retrigger_guard_suppresses_close_crossings() {
        // guard = spike_length + post_threshold = 15
        let samples = pulse_at(200, &[50, 60, 70], 1.0, 2);
        assert_eq!(detector().detect(&samples, 0.5), vec![50, 70]);
    }

    #[test]
    fn crossings_near_edges_are_skipped() {
        // pre = 5: position 3 cannot fit, end: 200 - 15 = 185 is the last fitting start
        let samples = pulse_at(200, &[3, 100, 186], 1.0, 1);
        assert_eq!(detector().detect(&samples, 0.5), vec![100]);

        let samples = pulse_at(200, &[185], 1.0, 1);
        assert_eq!(detector().detect(&samples, 0.5), vec![185]);
    }

    #[test]
    fn signal_starting_above_threshold_is_not_a_crossing() {
        let mut samples = pulse_at(200, &[0], 1.0, 10);
        samples[100] = 1.0;
        assert_eq!(detector().detect(&samples, 0.5), vec![100]);
    }

    #[test]
    fn snippet_has_fixed_length() {
        let samples: Vec<f32> = (0..200).map(|i| i as f32).collect();
        let d = detector();
        let snippet = d.snippet(&samples, 100).unwrap();
        assert_eq!(snippet.len(), d.snippet_len());
        assert_eq!(snippet[0], 95.0);
        assert!(d.snippet(&samples, 190).is_none());
    }
}
