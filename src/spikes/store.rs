use super::parameters::{compute_all, SpikeParameter};
use super::{Spike, UNASSIGNED_GROUP};
use crate::acquisition::Epoch;
use crate::config::SpikeConfig;
use crate::error::{Error, Result};
use crate::processing::detectors::ThresholdCrossingDetector;

use rayon::prelude::*;

/// Spikes of every channel, each list ordered by epoch index then position.
pub struct SpikeStore {
    sample_rate: f64,
    detector: ThresholdCrossingDetector,
    channels: Vec<Vec<Spike>>,
}

impl SpikeStore {
    pub fn new(num_channels: usize, sample_rate: f64, geometry: SpikeConfig) -> Self {
        Self {
            sample_rate,
            detector: ThresholdCrossingDetector::new(geometry),
            channels: vec![Vec::new(); num_channels],
        }
    }

    pub fn geometry(&self) -> SpikeConfig {
        self.detector.geometry()
    }

    /// Changes the snippet geometry. Returns true if it changed, in which
    /// case every stored spike is dropped and the caller has to rescan.
    pub fn set_spike_length(
        &mut self,
        pre_threshold: usize,
        post_threshold: usize,
        spike_length: usize,
    ) -> bool {
        let geometry = SpikeConfig {
            pre_threshold,
            post_threshold,
            spike_length,
        };
        if geometry == self.detector.geometry() {
            return false;
        }
        self.detector = ThresholdCrossingDetector::new(geometry);
        self.clear();
        log::debug!(
            "Spike geometry set to {}+{}+{} samples, stored spikes dropped",
            pre_threshold,
            spike_length,
            post_threshold
        );
        true
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn set_num_channels(&mut self, num_channels: usize) {
        self.channels.resize_with(num_channels, Vec::new);
    }

    /// Detects and stores the spikes of every channel of `epoch`. Spikes
    /// previously stored for the same epoch are replaced. Returns the number
    /// of spikes added.
    pub fn add(&mut self, epoch: &Epoch) -> Result<usize> {
        if epoch.num_channels() != self.channels.len() {
            return Err(Error::DataConsistency(format!(
                "epoch {} has {} channels, spike store has {}",
                epoch.index,
                epoch.num_channels(),
                self.channels.len()
            )));
        }

        let detected: Vec<Vec<Spike>> = (0..self.channels.len())
            .into_par_iter()
            .map(|channel| self.extract(epoch, channel))
            .collect::<Result<_>>()?;

        let mut added = 0;
        for (spikes, new) in self.channels.iter_mut().zip(detected) {
            added += new.len();
            let range = epoch_range(spikes, epoch.index);
            spikes.splice(range, new);
        }
        Ok(added)
    }

    fn extract(&self, epoch: &Epoch, channel: usize) -> Result<Vec<Spike>> {
        let samples = epoch.channel(channel)?;
        let threshold = epoch.thresholds[channel];
        let pre = self.detector.geometry().pre_threshold;

        let spikes = self
            .detector
            .detect(samples, threshold)
            .into_iter()
            .filter_map(|position| {
                let waveform = self.detector.snippet(samples, position)?;
                Some(Spike {
                    channel,
                    position,
                    time: epoch.start_time + position as f64 / self.sample_rate,
                    waveform: waveform.to_vec(),
                    threshold,
                    stimulus_index: epoch.stimulus_index,
                    epoch_index: epoch.index,
                    repetition_index: epoch.repetition_index,
                    features: compute_all(waveform, pre, self.sample_rate),
                    group: UNASSIGNED_GROUP,
                })
            })
            .collect();
        Ok(spikes)
    }

    /// Removes the spikes of one epoch on one channel, returning how many.
    pub fn remove(&mut self, channel: usize, epoch_index: usize) -> Result<usize> {
        let spikes = self.channel_mut(channel)?;
        let range = epoch_range(spikes, epoch_index);
        let removed = range.len();
        spikes.drain(range);
        Ok(removed)
    }

    /// Drops everything and re-detects from the epochs that still hold raw
    /// data. Returns the number of epochs scanned.
    pub fn rescan<'a, I>(&mut self, epochs: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Epoch>,
    {
        self.clear();
        let mut scanned = 0;
        for epoch in epochs {
            if !epoch.has_data() {
                log::debug!("Epoch {} has no raw data, not rescanned", epoch.index);
                continue;
            }
            self.add(epoch)?;
            scanned += 1;
        }
        Ok(scanned)
    }

    pub fn clear(&mut self) {
        for spikes in self.channels.iter_mut() {
            spikes.clear();
        }
    }

    // ---- Accessors ----

    fn channel_ref(&self, channel: usize) -> Result<&Vec<Spike>> {
        let num_channels = self.channels.len();
        self.channels
            .get(channel)
            .ok_or(Error::ChannelIndex { channel, num_channels })
    }

    fn channel_mut(&mut self, channel: usize) -> Result<&mut Vec<Spike>> {
        let num_channels = self.channels.len();
        self.channels
            .get_mut(channel)
            .ok_or(Error::ChannelIndex { channel, num_channels })
    }

    pub fn spikes(&self, channel: usize) -> Result<&[Spike]> {
        self.channel_ref(channel).map(|s| s.as_slice())
    }

    pub fn num_spikes(&self, channel: usize) -> Result<usize> {
        self.channel_ref(channel).map(|s| s.len())
    }

    pub fn total_spikes(&self) -> usize {
        self.channels.iter().map(|s| s.len()).sum()
    }

    pub fn spike(&self, channel: usize, index: usize) -> Result<&Spike> {
        let spikes = self.channel_ref(channel)?;
        spikes.get(index).ok_or(Error::SpikeIndex {
            channel,
            index,
            len: spikes.len(),
        })
    }

    pub fn spike_time(&self, channel: usize, index: usize) -> Result<f64> {
        self.spike(channel, index).map(|s| s.time)
    }

    pub fn spike_position(&self, channel: usize, index: usize) -> Result<usize> {
        self.spike(channel, index).map(|s| s.position)
    }

    pub fn spike_stim_index(&self, channel: usize, index: usize) -> Result<usize> {
        self.spike(channel, index).map(|s| s.stimulus_index)
    }

    pub fn spike_epoch_index(&self, channel: usize, index: usize) -> Result<usize> {
        self.spike(channel, index).map(|s| s.epoch_index)
    }

    pub fn spike_repetition_index(&self, channel: usize, index: usize) -> Result<usize> {
        self.spike(channel, index).map(|s| s.repetition_index)
    }

    pub fn spike_threshold(&self, channel: usize, index: usize) -> Result<f32> {
        self.spike(channel, index).map(|s| s.threshold)
    }

    pub fn spike_group(&self, channel: usize, index: usize) -> Result<i32> {
        self.spike(channel, index).map(|s| s.group)
    }

    pub fn spike_param(&self, channel: usize, index: usize, which: SpikeParameter) -> Result<f64> {
        self.spike(channel, index).map(|s| s.param(which))
    }

    pub fn set_spike_group(&mut self, channel: usize, index: usize, group: i32) -> Result<()> {
        let spikes = self.channel_mut(channel)?;
        let len = spikes.len();
        let spike = spikes
            .get_mut(index)
            .ok_or(Error::SpikeIndex { channel, index, len })?;
        spike.group = group;
        Ok(())
    }
}

/// Contiguous range of spikes belonging to `epoch_index`.
fn epoch_range(spikes: &[Spike], epoch_index: usize) -> std::ops::Range<usize> {
    let start = spikes.partition_point(|s| s.epoch_index < epoch_index);
    let end = spikes.partition_point(|s| s.epoch_index <= epoch_index);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::EpochData;

    const FS: f64 = 10_000.0;

    fn geometry() -> SpikeConfig {
        SpikeConfig {
            pre_threshold: 5,
            post_threshold: 5,
            spike_length: 10,
        }
    }

    fn epoch(index: usize, channels: Vec<Vec<f32>>, thresholds: Vec<f32>) -> Epoch {
        let num_samples = channels[0].len();
        let num_channels = channels.len();
        let samples = channels.into_iter().flatten().collect();
        let data = EpochData::new(num_channels, num_samples, samples).unwrap();
        let start = index as f64 * num_samples as f64 / FS;
        Epoch::new(index, index % 3, index / 3, start, thresholds, data)
    }

    fn spikes_at(len: usize, positions: &[usize]) -> Vec<f32> {
        let mut samples = vec![0.0; len];
        for &p in positions {
            samples[p] = 1.0;
            samples[p + 1] = 0.6;
        }
        samples
    }

    #[test]
    fn add_tags_spikes_with_epoch_context() {
        let mut store = SpikeStore::new(2, FS, geometry());
        let e = epoch(4, vec![spikes_at(200, &[50, 120]), vec![0.0; 200]], vec![0.5, 0.5]);
        assert_eq!(store.add(&e).unwrap(), 2);

        assert_eq!(store.num_spikes(0).unwrap(), 2);
        assert_eq!(store.num_spikes(1).unwrap(), 0);
        assert_eq!(store.spike_position(0, 1).unwrap(), 120);
        assert_eq!(store.spike_epoch_index(0, 0).unwrap(), 4);
        assert_eq!(store.spike_stim_index(0, 0).unwrap(), 1);
        assert_eq!(store.spike_repetition_index(0, 0).unwrap(), 1);
        assert_eq!(store.spike_threshold(0, 0).unwrap(), 0.5);
        assert_eq!(store.spike_group(0, 0).unwrap(), UNASSIGNED_GROUP);
        assert_eq!(store.spike(0, 0).unwrap().waveform.len(), 20);

        let expected_time = e.start_time + 50.0 / FS;
        assert!((store.spike_time(0, 0).unwrap() - expected_time).abs() < 1e-12);
        let max = store.spike_param(0, 0, SpikeParameter::MaxAmplitude).unwrap();
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn accessors_reject_out_of_range() {
        let store = SpikeStore::new(1, FS, geometry());
        assert!(matches!(
            store.spike(0, 0),
            Err(Error::SpikeIndex { channel: 0, index: 0, len: 0 })
        ));
        assert!(matches!(
            store.num_spikes(3),
            Err(Error::ChannelIndex { channel: 3, num_channels: 1 })
        ));
    }

    #[test]
    fn remove_then_add_is_identical() {
        let mut store = SpikeStore::new(1, FS, geometry());
        let e0 = epoch(0, vec![spikes_at(200, &[30, 90])], vec![0.5]);
        let e1 = epoch(1, vec![spikes_at(200, &[60])], vec![0.5]);
        store.add(&e0).unwrap();
        store.add(&e1).unwrap();
        let before = store.spikes(0).unwrap().to_vec();

        assert_eq!(store.remove(0, 0).unwrap(), 2);
        assert_eq!(store.num_spikes(0).unwrap(), 1);
        store.add(&e0).unwrap();
        assert_eq!(store.spikes(0).unwrap(), before.as_slice());
    }

    #[test]
    fn re_adding_an_epoch_replaces_its_spikes() {
        let mut store = SpikeStore::new(1, FS, geometry());
        let e = epoch(2, vec![spikes_at(200, &[30, 90])], vec![0.5]);
        store.add(&e).unwrap();
        store.add(&e).unwrap();
        assert_eq!(store.num_spikes(0).unwrap(), 2);

        // Raised threshold: the same epoch now yields nothing
        let quiet = epoch(2, vec![spikes_at(200, &[30, 90])], vec![2.0]);
        store.add(&quiet).unwrap();
        assert_eq!(store.num_spikes(0).unwrap(), 0);
    }

    #[test]
    fn geometry_change_drops_spikes() {
        let mut store = SpikeStore::new(1, FS, geometry());
        store.add(&epoch(0, vec![spikes_at(200, &[30])], vec![0.5])).unwrap();
        assert!(!store.set_spike_length(5, 5, 10));
        assert_eq!(store.num_spikes(0).unwrap(), 1);
        assert!(store.set_spike_length(8, 5, 10));
        assert_eq!(store.num_spikes(0).unwrap(), 0);
    }

    #[test]
    fn released_epochs_are_not_rescanned() {
        let mut store = SpikeStore::new(1, FS, geometry());
        let e0 = epoch(0, vec![spikes_at(200, &[30])], vec![0.5]);
        let mut e1 = epoch(1, vec![spikes_at(200, &[40])], vec![0.5]);
        e1.clear_data();
        assert!(matches!(store.add(&e1), Err(Error::EpochDataReleased(1))));
        assert_eq!(store.rescan([&e0, &e1]).unwrap(), 1);
        assert_eq!(store.num_spikes(0).unwrap(), 1);
    }

    #[test]
    fn groups_are_mutable() {
        let mut store = SpikeStore::new(1, FS, geometry());
        store.add(&epoch(0, vec![spikes_at(200, &[30])], vec![0.5])).unwrap();
        store.set_spike_group(0, 0, 3).unwrap();
        assert_eq!(store.spike_group(0, 0).unwrap(), 3);
        assert!(store.set_spike_group(0, 1, 3).is_err());
    }
}
