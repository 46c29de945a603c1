// src/config/mod.rs
use crate::error::{Error, Result};
use crate::processing::filters::bandpass::BandPassFilterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub spikes: SpikeConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AcquisitionConfig {
    pub sample_rate: f64,
    pub num_channels: usize,
    /// Epoch length (= repetition period) in samples.
    pub epoch_samples: usize,
    /// Output channels available to stimuli.
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    /// Number of most recent epochs that keep their raw samples in memory.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Capacity of the callback -> control thread epoch queue.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default)]
    pub thresholds: Vec<f32>,
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    #[serde(default)]
    pub filter: Option<BandPassFilterConfig>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            num_channels: 1,
            epoch_samples: 44100,
            output_channels: default_output_channels(),
            retention: default_retention(),
            pending_capacity: default_pending_capacity(),
            thresholds: Vec::new(),
            trigger: None,
            filter: None,
        }
    }
}

fn default_output_channels() -> usize {
    2
}

fn default_retention() -> usize {
    50
}

fn default_pending_capacity() -> usize {
    32
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TriggerConfig {
    /// Rising crossing of this level on the trigger channel marks a stimulus onset.
    pub level: f32,
    pub search_window_samples: usize,
    pub jitter_tolerance_samples: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SpikeConfig {
    pub pre_threshold: usize,
    pub post_threshold: usize,
    pub spike_length: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            pre_threshold: 10,
            post_threshold: 10,
            spike_length: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SequenceConfig {
    pub repetitions: usize,
    pub randomize: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            repetitions: 1,
            randomize: false,
            seed: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub verbose: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let acq = &self.acquisition;
        if acq.num_channels == 0 {
            return Err(Error::Configuration("num_channels must be > 0".into()));
        }
        if acq.epoch_samples == 0 {
            return Err(Error::Configuration("epoch_samples must be > 0".into()));
        }
        if !(acq.sample_rate > 0.0) {
            return Err(Error::Configuration(format!(
                "invalid sample_rate {}",
                acq.sample_rate
            )));
        }
        if !acq.thresholds.is_empty() && acq.thresholds.len() != acq.num_channels {
            return Err(Error::ThresholdLength {
                expected: acq.num_channels,
                found: acq.thresholds.len(),
            });
        }
        if acq.pending_capacity == 0 {
            return Err(Error::Configuration("pending_capacity must be > 0".into()));
        }
        if self.sequence.repetitions == 0 {
            return Err(Error::Configuration("repetitions must be > 0".into()));
        }
        Ok(())
    }

    /// Epoch duration in seconds.
    pub fn epoch_duration(&self) -> f64 {
        self.acquisition.epoch_samples as f64 / self.acquisition.sample_rate
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_with_defaults() {
        let yaml = "acquisition:\n  sample_rate: 1000.0\n  num_channels: 2\n  epoch_samples: 500\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.acquisition.retention, 50);
        assert_eq!(config.spikes, SpikeConfig::default());
        assert_eq!(config.sequence.repetitions, 1);
        assert!(config.acquisition.trigger.is_none());
        config.validate().unwrap();
        assert!((config.epoch_duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_zero_channels_and_bad_thresholds() {
        let mut config = Config::default();
        config.acquisition.num_channels = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.acquisition.num_channels = 2;
        config.acquisition.thresholds = vec![0.5];
        assert!(matches!(
            config.validate(),
            Err(Error::ThresholdLength { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn save_then_load_keeps_trigger_settings() {
        let mut config = Config::default();
        config.acquisition.trigger = Some(TriggerConfig {
            level: 0.3,
            search_window_samples: 4000,
            jitter_tolerance_samples: 3,
        });
        let path = std::env::temp_dir().join(format!("spike_epochs_cfg_{}.yaml", std::process::id()));
        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let trigger = loaded.acquisition.trigger.unwrap();
        assert_eq!(trigger.search_window_samples, 4000);
        assert_eq!(trigger.jitter_tolerance_samples, 3);
    }
}
