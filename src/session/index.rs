//! Epoch index document written next to the raw epoch stream.
//!
//! Sequences are stored as space separated integers (stimulus indices
//! 1-based), thresholds as bracketed space separated floats (`"[0.5 -0.3]"`).
//! Both are parsed into typed fields once, at load.

use crate::config::SpikeConfig;
use crate::error::{Error, Result};
use crate::stimulus::StimulusSetDescriptor;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochEntry {
    pub index: usize,
    pub done: bool,
    /// Thresholds in effect at capture; missing in older documents.
    #[serde(default, with = "bracketed_opt", skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochIndex {
    pub created: DateTime<Local>,
    pub sample_rate: f64,
    pub num_channels: usize,
    pub epoch_samples: usize,
    #[serde(default)]
    pub spikes: SpikeConfig,
    /// Global thresholds at the time of the last save.
    #[serde(with = "bracketed")]
    pub thresholds: Vec<f32>,
    pub stimuli: StimulusSetDescriptor,
    #[serde(with = "one_based")]
    pub stimulus_sequence: Vec<usize>,
    #[serde(with = "spaced")]
    pub repetition_sequence: Vec<usize>,
    #[serde(default)]
    pub epoches: Vec<EpochEntry>,
}

impl EpochIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;
        let index: EpochIndex = serde_yaml::from_str(&yaml)?;
        index.validate()?;
        Ok(index)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 || self.epoch_samples == 0 {
            return Err(Error::Configuration(format!(
                "index describes {} channels x {} samples",
                self.num_channels, self.epoch_samples
            )));
        }
        if self.thresholds.len() != self.num_channels {
            return Err(Error::ThresholdLength {
                expected: self.num_channels,
                found: self.thresholds.len(),
            });
        }
        if self.stimulus_sequence.len() != self.repetition_sequence.len() {
            return Err(Error::DataConsistency(format!(
                "stimulus sequence has {} entries, repetition sequence {}",
                self.stimulus_sequence.len(),
                self.repetition_sequence.len()
            )));
        }
        let num_stimuli = self.stimuli.stimuli.len();
        if let Some(&bad) = self.stimulus_sequence.iter().find(|&&s| s >= num_stimuli) {
            return Err(Error::DataConsistency(format!(
                "stimulus sequence references stimulus {} of {}",
                bad + 1,
                num_stimuli
            )));
        }
        for (position, entry) in self.epoches.iter().enumerate() {
            if entry.index != position {
                return Err(Error::DataConsistency(format!(
                    "epoch entry {} has index {}",
                    position, entry.index
                )));
            }
            if entry.index >= self.stimulus_sequence.len() {
                return Err(Error::DataConsistency(format!(
                    "epoch {} lies beyond the stimulus sequence ({} entries)",
                    entry.index,
                    self.stimulus_sequence.len()
                )));
            }
            if let Some(thresholds) = &entry.thresholds {
                if thresholds.len() != self.num_channels {
                    return Err(Error::ThresholdLength {
                        expected: self.num_channels,
                        found: thresholds.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Epochs marked done, i.e. the records expected in the raw stream.
    pub fn completed_epochs(&self) -> usize {
        self.epoches.iter().filter(|e| e.done).count()
    }
}

// FIELD FORMATS ---------------------------------------------------------------

pub fn format_thresholds(values: &[f32]) -> String {
    let inner: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", inner.join(" "))
}

pub fn parse_thresholds(text: &str) -> Result<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| Error::DataConsistency(format!("thresholds '{}' are not bracketed", text)))?;
    inner
        .split_whitespace()
        .map(|v| {
            v.parse::<f32>()
                .map_err(|_| Error::DataConsistency(format!("invalid threshold '{}'", v)))
        })
        .collect()
}

pub fn format_sequence(values: &[usize], offset: usize) -> String {
    let items: Vec<String> = values.iter().map(|v| (v + offset).to_string()).collect();
    items.join(" ")
}

pub fn parse_sequence(text: &str, offset: usize) -> Result<Vec<usize>> {
    text.split_whitespace()
        .map(|v| {
            v.parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(offset))
                .ok_or_else(|| Error::DataConsistency(format!("invalid sequence entry '{}'", v)))
        })
        .collect()
}

mod bracketed {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_thresholds(values))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_thresholds(&text).map_err(de::Error::custom)
    }
}

mod bracketed_opt {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        values: &Option<Vec<f32>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match values {
            Some(values) => serializer.serialize_str(&super::format_thresholds(values)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<f32>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::parse_thresholds(&text)
                .map(Some)
                .map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

mod one_based {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[usize], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_sequence(values, 1))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<usize>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_sequence(&text, 1).map_err(de::Error::custom)
    }
}

mod spaced {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[usize], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_sequence(values, 0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<usize>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_sequence(&text, 0).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::StimulusDescriptor;

    fn index() -> EpochIndex {
        EpochIndex {
            created: Local::now(),
            sample_rate: 1000.0,
            num_channels: 2,
            epoch_samples: 100,
            spikes: SpikeConfig::default(),
            thresholds: vec![0.5, -0.25],
            stimuli: StimulusSetDescriptor {
                parameters: Vec::new(),
                stimuli: (0..3)
                    .map(|i| StimulusDescriptor {
                        id: format!("s{}", i),
                        name: None,
                        num_samples: 50,
                        num_output_channels: 1,
                        values: Vec::new(),
                    })
                    .collect(),
            },
            stimulus_sequence: vec![2, 0, 1],
            repetition_sequence: vec![0, 0, 0],
            epoches: vec![
                EpochEntry {
                    index: 0,
                    done: true,
                    thresholds: Some(vec![0.5, -0.25]),
                },
                EpochEntry {
                    index: 1,
                    done: true,
                    thresholds: None,
                },
            ],
        }
    }

    #[test]
    fn field_formats() {
        assert_eq!(format_thresholds(&[0.5, -0.25]), "[0.5 -0.25]");
        assert_eq!(parse_thresholds(" [0.5  -0.25] ").unwrap(), vec![0.5, -0.25]);
        assert!(parse_thresholds("0.5 0.25").is_err());
        assert_eq!(format_sequence(&[2, 0, 1], 1), "3 1 2");
        assert_eq!(parse_sequence("3 1 2", 1).unwrap(), vec![2, 0, 1]);
        assert!(parse_sequence("0 1", 1).is_err());
    }

    #[test]
    fn yaml_uses_one_based_sequences() {
        let yaml = serde_yaml::to_string(&index()).unwrap();
        assert!(yaml.contains("stimulus_sequence: 3 1 2"));
        assert!(yaml.contains("[0.5 -0.25]"));

        let parsed: EpochIndex = serde_yaml::from_str(&yaml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.stimulus_sequence, vec![2, 0, 1]);
        assert_eq!(parsed.epoches[1].thresholds, None);
        assert_eq!(parsed.completed_epochs(), 2);
    }

    #[test]
    fn validation_catches_inconsistencies() {
        let mut bad = index();
        bad.repetition_sequence.pop();
        assert!(matches!(bad.validate(), Err(Error::DataConsistency(_))));

        let mut bad = index();
        bad.stimulus_sequence[0] = 3;
        assert!(bad.validate().is_err());

        let mut bad = index();
        bad.epoches[0].thresholds = Some(vec![0.5]);
        assert!(matches!(bad.validate(), Err(Error::ThresholdLength { .. })));

        let mut bad = index();
        bad.epoches[1].index = 5;
        assert!(bad.validate().is_err());
    }
}
