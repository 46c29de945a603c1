use super::TriggerInstance;

pub struct PulseTriggerConfig {
    pub level: f32,
    /// Samples after an onset during which further crossings are ignored.
    pub cooldown_samples: usize,
}

pub struct PulseTrigger {
    config: PulseTriggerConfig,
    last_sample: f32,
    samples_since_onset: Option<usize>,
}

impl PulseTrigger {
    pub fn new(config: PulseTriggerConfig) -> Self {
        Self {
            config,
            last_sample: 0.0,
            samples_since_onset: None,
        }
    }
}

impl TriggerInstance for PulseTrigger {
    fn process_sample(&mut self, sample: f32) -> bool {
        let rising = self.last_sample < self.config.level && sample >= self.config.level;
        self.last_sample = sample;

        let cooling_down = self
            .samples_since_onset
            .map_or(false, |n| n < self.config.cooldown_samples);
        if let Some(n) = self.samples_since_onset.as_mut() {
            *n = n.saturating_add(1);
        }

        if rising && !cooling_down {
            self.samples_since_onset = Some(1);
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.last_sample = 0.0;
        self.samples_since_onset = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onsets(trigger: &mut PulseTrigger, samples: &[f32]) -> Vec<usize> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| trigger.process_sample(s).then_some(i))
            .collect()
    }

    #[test]
    fn reports_rising_edges() {
        let mut trigger = PulseTrigger::new(PulseTriggerConfig {
            level: 0.5,
            cooldown_samples: 0,
        });
        let mut samples = vec![0.0f32; 100];
        samples[10] = 1.0;
        samples[11] = 1.0;
        samples[60] = 1.0;
        assert_eq!(onsets(&mut trigger, &samples), vec![10, 60]);
    }

    #[test]
    fn cooldown_ignores_ringing() {
        let mut trigger = PulseTrigger::new(PulseTriggerConfig {
            level: 0.5,
            cooldown_samples: 20,
        });
        let mut samples = vec![0.0f32; 100];
        samples[10] = 1.0;
        samples[13] = 1.0;
        samples[40] = 1.0;
        assert_eq!(onsets(&mut trigger, &samples), vec![10, 40]);
    }
}
