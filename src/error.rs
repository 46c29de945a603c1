use std::fmt;
use thiserror::Error;

/// Trigger faults raised on the callback thread and polled by the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFault {
    FirstTriggerNotFound,
    JitterExceeded,
}

impl fmt::Display for TriggerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerFault::FirstTriggerNotFound => write!(f, "first trigger not found"),
            TriggerFault::JitterExceeded => write!(f, "trigger jitter exceeds tolerance"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Channel {channel} out of range ({num_channels} channels)")]
    ChannelIndex { channel: usize, num_channels: usize },

    #[error("Spike {index} out of range on channel {channel} ({len} spikes)")]
    SpikeIndex {
        channel: usize,
        index: usize,
        len: usize,
    },

    #[error("Epoch {0} not found")]
    EpochNotFound(usize),

    #[error("Raw data of epoch {0} has been released")]
    EpochDataReleased(usize),

    #[error("Threshold vector has {found} values, expected {expected}")]
    ThresholdLength { expected: usize, found: usize },

    #[error("Data consistency error: {0}")]
    DataConsistency(String),

    #[error("Trigger error: {0}")]
    Trigger(TriggerFault),

    #[error("Pending epoch queue overrun")]
    QueueOverrun,

    #[error("Raw epoch stream write failed")]
    WriteFailed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
