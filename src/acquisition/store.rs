use super::epoch::{Epoch, EpochData};
use super::raw_file::RawEpochWriter;
use super::recorder::{CompletedEpoch, EpochFrame, Recorder, RecorderPhase};
use super::status::{AcquisitionStatus, StatusSnapshot};
use crate::config::{AcquisitionConfig, TriggerConfig};
use crate::error::{Error, Result};
use crate::processing::filters::bandpass::{BandPassFilter, BandPassFilterConfig};
use crate::processing::filters::FilterInstance;
use crate::stimulus::sequence::StimulusSequence;

use rtrb::{Consumer, Producer, RingBuffer};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

// Lock order: recorder -> consumer -> thresholds.

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Layout {
    num_channels: usize,
    epoch_samples: usize,
}

struct Thresholds {
    values: Mutex<Vec<f32>>,
    /// Set once thresholds were loaded explicitly rather than defaulted.
    loaded: Mutex<bool>,
}

/// Control-thread half: pending queue consumer and the retained epochs.
struct ConsumerSide {
    pending_rx: Consumer<CompletedEpoch>,
    recycle_tx: Producer<EpochFrame>,
    retained: Vec<Epoch>,
}

impl ConsumerSide {
    fn find(&self, index: usize) -> Option<usize> {
        self.retained.binary_search_by_key(&index, |e| e.index).ok()
    }

    fn recycle(&mut self, data: EpochData, num_channels: usize, epoch_samples: usize) {
        let samples = data.into_samples();
        if samples.len() != num_channels * epoch_samples {
            return;
        }
        let frame = EpochFrame {
            samples,
            thresholds: vec![0.0; num_channels],
        };
        // A full pool just drops the extra frame
        let _ = self.recycle_tx.push(frame);
    }
}

/// Segments the incoming sample stream into epochs and keeps them for
/// consumers. Share it through an `Arc`: `sound_proc` runs on the audio
/// callback thread, everything else on the control thread.
///
/// While the driver runs, the callback shares the threshold vector, the
/// pending queue and the status flags with the control thread. Run control
/// (`arm`, `pause`, `resume`, `stop`, `phase`, `next_index`, `is_saving`,
/// the save session calls and `push`) briefly takes the callback's lock;
/// `flush_save` holds it for one buffered write. `initialize` and `clear`
/// replace or reset the recorder and must not be called while blocks are
/// being delivered.
pub struct EpochStore {
    sample_rate: f64,
    retention: usize,
    pending_capacity: usize,
    trigger: Option<TriggerConfig>,
    filter: Option<BandPassFilterConfig>,
    layout: Mutex<Layout>,
    recorder: Mutex<Recorder>,
    consumer: Mutex<ConsumerSide>,
    thresholds: Thresholds,
    status: AcquisitionStatus,
}

impl EpochStore {
    pub fn new(config: &AcquisitionConfig) -> Result<Self> {
        if config.num_channels == 0 || config.epoch_samples == 0 {
            return Err(Error::Configuration(format!(
                "cannot initialize {} channels x {} samples",
                config.num_channels, config.epoch_samples
            )));
        }
        let loaded = !config.thresholds.is_empty();
        if loaded && config.thresholds.len() != config.num_channels {
            return Err(Error::ThresholdLength {
                expected: config.num_channels,
                found: config.thresholds.len(),
            });
        }
        let thresholds = if loaded {
            config.thresholds.clone()
        } else {
            vec![0.0; config.num_channels]
        };

        let retention = config.retention.max(1);
        let pending_capacity = config.pending_capacity.max(1);
        let (recorder, consumer) = Self::build_halves(
            config.num_channels,
            config.epoch_samples,
            config.sample_rate,
            retention,
            pending_capacity,
            config.filter.as_ref(),
            config.trigger.clone(),
        );

        Ok(Self {
            sample_rate: config.sample_rate,
            retention,
            pending_capacity,
            trigger: config.trigger.clone(),
            filter: config.filter.clone(),
            layout: Mutex::new(Layout {
                num_channels: config.num_channels,
                epoch_samples: config.epoch_samples,
            }),
            recorder: Mutex::new(recorder),
            consumer: Mutex::new(consumer),
            thresholds: Thresholds {
                values: Mutex::new(thresholds),
                loaded: Mutex::new(loaded),
            },
            status: AcquisitionStatus::new(),
        })
    }

    fn build_halves(
        num_channels: usize,
        epoch_samples: usize,
        sample_rate: f64,
        retention: usize,
        pending_capacity: usize,
        filter: Option<&BandPassFilterConfig>,
        trigger: Option<TriggerConfig>,
    ) -> (Recorder, ConsumerSide) {
        // Every buffer the callback can need is allocated here
        let pool_size = retention + pending_capacity + 2;
        let (mut free_tx, free_rx) = RingBuffer::<EpochFrame>::new(pool_size);
        for _ in 0..pool_size {
            let _ = free_tx.push(EpochFrame::new(num_channels, epoch_samples));
        }
        let (pending_tx, pending_rx) = RingBuffer::<CompletedEpoch>::new(pending_capacity);

        let filters: Vec<Box<dyn FilterInstance>> = match filter {
            Some(config) => (0..num_channels)
                .map(|_| Box::new(BandPassFilter::new(config, sample_rate)) as Box<dyn FilterInstance>)
                .collect(),
            None => Vec::new(),
        };

        let recorder = Recorder::new(num_channels, epoch_samples, free_rx, pending_tx, filters, trigger);
        let consumer = ConsumerSide {
            pending_rx,
            recycle_tx: free_tx,
            retained: Vec::new(),
        };
        (recorder, consumer)
    }

    /// (Re)allocates all buffers for a new geometry and resets counters.
    pub fn initialize(&self, num_channels: usize, epoch_samples: usize) -> Result<()> {
        if num_channels == 0 || epoch_samples == 0 {
            return Err(Error::Configuration(format!(
                "cannot initialize {} channels x {} samples",
                num_channels, epoch_samples
            )));
        }

        {
            let loaded = *lock(&self.thresholds.loaded);
            let count = lock(&self.thresholds.values).len();
            if loaded && count != num_channels {
                return Err(Error::Configuration(format!(
                    "{} channels requested but {} thresholds are loaded",
                    num_channels, count
                )));
            }
        }

        // Allocate before taking the callback lock
        let (new_recorder, new_consumer) = Self::build_halves(
            num_channels,
            epoch_samples,
            self.sample_rate,
            self.retention,
            self.pending_capacity,
            self.filter.as_ref(),
            self.trigger.clone(),
        );

        let mut recorder = lock(&self.recorder);
        let mut consumer = lock(&self.consumer);
        lock(&self.thresholds.values).resize(num_channels, 0.0);
        // An open save session survives re-initialization only if the record size is unchanged
        let writer = recorder.take_writer();
        let old_recorder = std::mem::replace(&mut *recorder, new_recorder);
        let old_consumer = std::mem::replace(&mut *consumer, new_consumer);
        let stale_writer = {
            let mut layout = lock(&self.layout);
            let kept = layout.num_channels == num_channels && layout.epoch_samples == epoch_samples;
            layout.num_channels = num_channels;
            layout.epoch_samples = epoch_samples;
            if kept {
                recorder.set_writer(writer);
                None
            } else {
                writer
            }
        };
        drop(consumer);
        drop(recorder);
        drop((old_recorder, old_consumer, stale_writer));
        self.status.reset();
        log::debug!(
            "Epoch store initialized: {} channels x {} samples",
            num_channels,
            epoch_samples
        );
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        lock(&self.layout).num_channels
    }

    pub fn epoch_samples(&self) -> usize {
        lock(&self.layout).epoch_samples
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    // ---- Thresholds ----

    pub fn set_threshold(&self, channel: usize, value: f32) -> Result<()> {
        let mut thresholds = lock(&self.thresholds.values);
        let num_channels = thresholds.len();
        let slot = thresholds
            .get_mut(channel)
            .ok_or(Error::ChannelIndex { channel, num_channels })?;
        *slot = value;
        Ok(())
    }

    pub fn threshold(&self, channel: usize) -> Result<f32> {
        let thresholds = lock(&self.thresholds.values);
        thresholds.get(channel).copied().ok_or(Error::ChannelIndex {
            channel,
            num_channels: thresholds.len(),
        })
    }

    pub fn thresholds(&self) -> Vec<f32> {
        lock(&self.thresholds.values).clone()
    }

    /// Replaces the whole threshold vector; its length must match the channel count.
    pub fn load_thresholds(&self, values: &[f32]) -> Result<()> {
        let num_channels = self.num_channels();
        if values.len() != num_channels {
            return Err(Error::ThresholdLength {
                expected: num_channels,
                found: values.len(),
            });
        }
        let mut thresholds = lock(&self.thresholds.values);
        thresholds.clear();
        thresholds.extend_from_slice(values);
        *lock(&self.thresholds.loaded) = true;
        Ok(())
    }

    // ---- Callback ----

    /// Audio callback entry point: one call per hardware block with one
    /// buffer per recording channel (plus the trigger channel when a trigger
    /// is configured), all of equal length. Faults are reported through
    /// [`EpochStore::status`], never returned.
    pub fn sound_proc(&self, buffers: &[&[f32]], trigger_test_mode: bool) {
        let mut recorder = lock(&self.recorder);
        recorder.process_block(buffers, trigger_test_mode, &self.thresholds.values, &self.status);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    // ---- Recorder control ----

    /// Bounds acquisition to `sequence`; epochs take their stimulus and
    /// repetition index from it by acquisition index.
    pub fn arm(&self, sequence: &StimulusSequence) {
        let mut recorder = lock(&self.recorder);
        recorder.arm(sequence.stimuli(), sequence.repetitions());
        self.status.set_finished(recorder.phase() == RecorderPhase::Finished);
    }

    pub fn pause(&self) {
        lock(&self.recorder).pause();
    }

    pub fn resume(&self) {
        let mut recorder = lock(&self.recorder);
        recorder.restart();
        self.status.set_finished(recorder.phase() == RecorderPhase::Finished);
    }

    pub fn stop(&self) {
        lock(&self.recorder).stop();
    }

    pub fn phase(&self) -> RecorderPhase {
        lock(&self.recorder).phase()
    }

    /// Index the next completed epoch will get.
    pub fn next_index(&self) -> usize {
        lock(&self.recorder).next_index()
    }

    // ---- Consumer side ----

    /// Dequeues the next completed epoch. The flag is true when it was the
    /// last one currently queued.
    pub fn pop(&self) -> Option<(Epoch, bool)> {
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        let mut consumer = lock(&self.consumer);
        let completed = consumer.pending_rx.pop().ok()?;
        let is_last = consumer.pending_rx.is_empty();

        let CompletedEpoch {
            index,
            stimulus_index,
            repetition_index,
            frame,
        } = completed;
        let data = match EpochData::new(num_channels, epoch_samples, frame.samples) {
            Ok(data) => data,
            // Frames are always sized from the layout they were allocated for
            Err(_) => return None,
        };
        let epoch = Epoch::new(
            index,
            stimulus_index,
            repetition_index,
            self.start_time(index, epoch_samples),
            frame.thresholds,
            data,
        );
        let returned = epoch.clone();
        self.retain(&mut consumer, epoch, num_channels, epoch_samples);
        Some((returned, is_last))
    }

    /// Number of completed epochs still waiting in the pending queue.
    pub fn pending_count(&self) -> usize {
        lock(&self.consumer).pending_rx.slots()
    }

    /// Feeds a previously recorded epoch through the epoch model without the
    /// callback path (offline reconstruction).
    pub fn push(
        &self,
        samples: Vec<f32>,
        thresholds: Vec<f32>,
        stimulus_index: usize,
        repetition_index: usize,
    ) -> Result<Epoch> {
        let mut recorder = lock(&self.recorder);
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        if thresholds.len() != num_channels {
            return Err(Error::ThresholdLength {
                expected: num_channels,
                found: thresholds.len(),
            });
        }
        let data = EpochData::new(num_channels, epoch_samples, samples)?;

        let mut consumer = lock(&self.consumer);
        let index = consumer
            .retained
            .last()
            .map_or(0, |e| e.index + 1)
            .max(recorder.next_index());
        recorder.advance_next_index(index + 1);
        drop(recorder);

        let epoch = Epoch::new(
            index,
            stimulus_index,
            repetition_index,
            self.start_time(index, epoch_samples),
            thresholds,
            data,
        );
        let returned = epoch.clone();
        self.retain(&mut consumer, epoch, num_channels, epoch_samples);
        Ok(returned)
    }

    fn start_time(&self, index: usize, epoch_samples: usize) -> f64 {
        index as f64 * epoch_samples as f64 / self.sample_rate
    }

    fn retain(
        &self,
        consumer: &mut ConsumerSide,
        epoch: Epoch,
        num_channels: usize,
        epoch_samples: usize,
    ) {
        consumer.retained.push(epoch);
        let len = consumer.retained.len();
        if len > self.retention {
            let evict = len - 1 - self.retention;
            if let Some(data) = consumer.retained[evict].clear_data() {
                consumer.recycle(data, num_channels, epoch_samples);
            }
        }
    }

    /// Retained epoch by acquisition index, `None` for the most recent one.
    pub fn get(&self, index: Option<usize>) -> Option<Epoch> {
        let consumer = lock(&self.consumer);
        match index {
            None => consumer.retained.last().cloned(),
            Some(index) => consumer.find(index).map(|pos| consumer.retained[pos].clone()),
        }
    }

    /// Replaces the capture thresholds of a retained epoch and returns the
    /// updated epoch.
    pub fn set_epoch_thresholds(&self, index: usize, thresholds: &[f32]) -> Result<Epoch> {
        let mut consumer = lock(&self.consumer);
        let pos = consumer.find(index).ok_or(Error::EpochNotFound(index))?;
        let epoch = &mut consumer.retained[pos];
        if thresholds.len() != epoch.thresholds.len() {
            return Err(Error::ThresholdLength {
                expected: epoch.thresholds.len(),
                found: thresholds.len(),
            });
        }
        epoch.thresholds.clear();
        epoch.thresholds.extend_from_slice(thresholds);
        Ok(epoch.clone())
    }

    /// Number of retained epochs; only the newest `retention` keep raw samples.
    pub fn count(&self) -> usize {
        lock(&self.consumer).retained.len()
    }

    /// Releases the raw samples of one retained epoch.
    pub fn clear_data(&self, index: usize) -> Result<()> {
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        let mut consumer = lock(&self.consumer);
        let pos = consumer.find(index).ok_or(Error::EpochNotFound(index))?;
        if let Some(data) = consumer.retained[pos].clear_data() {
            consumer.recycle(data, num_channels, epoch_samples);
        }
        Ok(())
    }

    /// Drops queued and retained epochs and resets counters. The raw file
    /// and any open save session are left alone.
    pub fn clear(&self) {
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        let mut recorder = lock(&self.recorder);
        let mut consumer = lock(&self.consumer);
        recorder.clear();
        while let Ok(completed) = consumer.pending_rx.pop() {
            let _ = consumer.recycle_tx.push(completed.frame);
        }
        let retained = std::mem::take(&mut consumer.retained);
        for mut epoch in retained {
            if let Some(data) = epoch.clear_data() {
                consumer.recycle(data, num_channels, epoch_samples);
            }
        }
        self.status.reset();
    }

    // ---- Save session ----

    /// Opens (truncating) the raw epoch stream for a fresh measurement.
    pub fn init_save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        let writer = RawEpochWriter::create(path.as_ref(), num_channels, epoch_samples)?;
        self.install_writer(writer, path.as_ref())
    }

    /// Reopens an existing raw stream at its end to continue a measurement.
    /// Returns the number of records already present.
    pub fn append_save<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let (num_channels, epoch_samples) = {
            let layout = lock(&self.layout);
            (layout.num_channels, layout.epoch_samples)
        };
        let writer = RawEpochWriter::append(path.as_ref(), num_channels, epoch_samples)?;
        let existing = writer.records_written();
        self.install_writer(writer, path.as_ref())?;
        Ok(existing)
    }

    fn install_writer(&self, writer: RawEpochWriter, path: &Path) -> Result<()> {
        let previous = lock(&self.recorder).set_writer(Some(writer));
        if let Some(mut previous) = previous {
            log::warn!("Save session was still open; closing it");
            previous.flush()?;
        }
        log::info!("Raw epoch stream open: {}", path.display());
        Ok(())
    }

    /// Flushes and closes the raw stream. Reports a write failure that
    /// happened on the callback thread.
    pub fn done_save(&self) -> Result<usize> {
        // Flush outside the recorder lock so the callback is not held up
        let writer = lock(&self.recorder).take_writer();
        let written = match writer {
            Some(mut writer) => {
                writer.flush()?;
                writer.records_written()
            }
            None => 0,
        };
        if self.status.snapshot().write_failed {
            return Err(Error::WriteFailed);
        }
        Ok(written)
    }

    pub fn is_saving(&self) -> bool {
        lock(&self.recorder).is_saving()
    }

    /// Flushes the open raw stream without closing it, so records written
    /// so far can be read back. Holds the callback lock for the write.
    pub fn flush_save(&self) -> Result<()> {
        lock(&self.recorder).flush_writer()?;
        Ok(())
    }
}
