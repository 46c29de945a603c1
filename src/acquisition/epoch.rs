use crate::error::{Error, Result};
use std::sync::Arc;

/// Raw samples of one epoch, channel-major (`channel * num_samples + i`).
#[derive(Debug, PartialEq)]
pub struct EpochData {
    num_channels: usize,
    num_samples: usize,
    samples: Vec<f32>,
}

impl EpochData {
    pub fn new(num_channels: usize, num_samples: usize, samples: Vec<f32>) -> Result<Self> {
        if samples.len() != num_channels * num_samples {
            return Err(Error::DataConsistency(format!(
                "epoch buffer holds {} samples, expected {} x {}",
                samples.len(),
                num_channels,
                num_samples
            )));
        }
        Ok(Self {
            num_channels,
            num_samples,
            samples,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn channel(&self, channel: usize) -> Option<&[f32]> {
        if channel >= self.num_channels {
            return None;
        }
        let start = channel * self.num_samples;
        Some(&self.samples[start..start + self.num_samples])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    pub(crate) fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// One completed epoch. Cloning is cheap: raw samples are shared.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub index: usize,
    pub stimulus_index: usize,
    pub repetition_index: usize,
    /// Seconds since measurement start.
    pub start_time: f64,
    /// Thresholds in effect when the epoch was captured.
    pub thresholds: Vec<f32>,
    done: bool,
    data: Option<Arc<EpochData>>,
}

impl Epoch {
    pub(crate) fn new(
        index: usize,
        stimulus_index: usize,
        repetition_index: usize,
        start_time: f64,
        thresholds: Vec<f32>,
        data: EpochData,
    ) -> Self {
        Self {
            index,
            stimulus_index,
            repetition_index,
            start_time,
            thresholds,
            done: true,
            data: Some(Arc::new(data)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&EpochData> {
        self.data.as_deref()
    }

    pub fn num_channels(&self) -> usize {
        self.thresholds.len()
    }

    pub fn num_samples(&self) -> Option<usize> {
        self.data.as_ref().map(|d| d.num_samples())
    }

    /// Samples of one channel; fails once the raw data has been released.
    pub fn channel(&self, channel: usize) -> Result<&[f32]> {
        let data = self.data.as_ref().ok_or(Error::EpochDataReleased(self.index))?;
        data.channel(channel).ok_or(Error::ChannelIndex {
            channel,
            num_channels: data.num_channels(),
        })
    }

    /// Drops the raw samples, keeping metadata. Returns the buffer when this
    /// was the last reference so it can go back to the pool.
    pub fn clear_data(&mut self) -> Option<EpochData> {
        self.data.take().and_then(|data| Arc::try_unwrap(data).ok())
    }

    /// Same epoch with raw samples attached again, e.g. read back from the
    /// raw stream after release.
    pub fn with_samples(mut self, samples: Vec<f32>, num_samples: usize) -> Result<Self> {
        let data = EpochData::new(self.num_channels(), num_samples, samples)?;
        self.data = Some(Arc::new(data));
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> Epoch {
        let data = EpochData::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        Epoch::new(7, 1, 0, 0.7, vec![0.5, -0.5], data)
    }

    #[test]
    fn channel_major_layout() {
        let epoch = epoch();
        assert_eq!(epoch.channel(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(epoch.channel(1).unwrap(), &[4.0, 5.0, 6.0]);
        assert!(matches!(
            epoch.channel(2),
            Err(Error::ChannelIndex { channel: 2, num_channels: 2 })
        ));
    }

    #[test]
    fn clear_data_keeps_metadata() {
        let mut epoch = epoch();
        let shared = epoch.clone();
        // Another clone still holds the samples, so nothing is handed back
        assert!(epoch.clear_data().is_none());
        assert!(!epoch.has_data());
        assert!(epoch.is_done());
        assert_eq!(epoch.index, 7);
        assert!(matches!(epoch.channel(0), Err(Error::EpochDataReleased(7))));
        assert!(shared.has_data());
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        assert!(matches!(
            EpochData::new(2, 3, vec![0.0; 5]),
            Err(Error::DataConsistency(_))
        ));
    }
}
