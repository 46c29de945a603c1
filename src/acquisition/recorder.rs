// Callback-side half of the epoch store. Everything in here runs on the audio
// thread: no logging, no error returns, no allocation outside pool misses.

use super::raw_file::RawEpochWriter;
use super::status::AcquisitionStatus;
use crate::config::TriggerConfig;
use crate::error::TriggerFault;
use crate::processing::filters::FilterInstance;
use crate::processing::triggers::pulse::{PulseTrigger, PulseTriggerConfig};
use crate::processing::triggers::TriggerInstance;

use rtrb::{Consumer, Producer, PushError};
use std::sync::{Mutex, PoisonError};

// EPOCH FRAMES ----------------------------------------------------------------

/// Pooled buffers for one epoch.
pub(crate) struct EpochFrame {
    pub samples: Vec<f32>,
    pub thresholds: Vec<f32>,
}

impl EpochFrame {
    pub fn new(num_channels: usize, epoch_samples: usize) -> Self {
        Self {
            samples: vec![0.0; num_channels * epoch_samples],
            thresholds: vec![0.0; num_channels],
        }
    }
}

/// A finished frame travelling from the callback to the control thread.
pub(crate) struct CompletedEpoch {
    pub index: usize,
    pub stimulus_index: usize,
    pub repetition_index: usize,
    pub frame: EpochFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderPhase {
    SearchingTrigger,
    Recording,
    Paused,
    Stopped,
    Finished,
}

// TRIGGER STATE ---------------------------------------------------------------

struct TriggerState {
    detector: PulseTrigger,
    config: TriggerConfig,
    searched: usize,
    test_clock: u64,
    test_last_onset: Option<u64>,
}

impl TriggerState {
    fn new(config: TriggerConfig, epoch_samples: usize) -> Self {
        let detector = PulseTrigger::new(PulseTriggerConfig {
            level: config.level,
            cooldown_samples: epoch_samples / 2,
        });
        Self {
            detector,
            config,
            searched: 0,
            test_clock: 0,
            test_last_onset: None,
        }
    }

    fn reset(&mut self) {
        self.detector.reset();
        self.searched = 0;
        self.test_clock = 0;
        self.test_last_onset = None;
    }
}

// RECORDER --------------------------------------------------------------------

pub(crate) struct Recorder {
    num_channels: usize,
    epoch_samples: usize,
    phase: RecorderPhase,
    current: Option<EpochFrame>,
    write_pos: usize,
    next_index: usize,
    stimulus_sequence: Vec<usize>,
    repetition_sequence: Vec<usize>,
    armed: bool,
    free_rx: Consumer<EpochFrame>,
    pending_tx: Producer<CompletedEpoch>,
    writer: Option<RawEpochWriter>,
    filters: Vec<Box<dyn FilterInstance>>,
    trigger: Option<TriggerState>,
}

impl Recorder {
    pub fn new(
        num_channels: usize,
        epoch_samples: usize,
        free_rx: Consumer<EpochFrame>,
        pending_tx: Producer<CompletedEpoch>,
        filters: Vec<Box<dyn FilterInstance>>,
        trigger: Option<TriggerConfig>,
    ) -> Self {
        let trigger = trigger.map(|config| TriggerState::new(config, epoch_samples));
        let mut recorder = Self {
            num_channels,
            epoch_samples,
            phase: RecorderPhase::Recording,
            current: None,
            write_pos: 0,
            next_index: 0,
            stimulus_sequence: Vec::new(),
            repetition_sequence: Vec::new(),
            armed: false,
            free_rx,
            pending_tx,
            writer: None,
            filters,
            trigger,
        };
        recorder.phase = recorder.start_phase();
        recorder
    }

    fn start_phase(&self) -> RecorderPhase {
        if self.trigger.is_some() {
            RecorderPhase::SearchingTrigger
        } else {
            RecorderPhase::Recording
        }
    }

    pub fn phase(&self) -> RecorderPhase {
        self.phase
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Only moves forward so indices stay strictly increasing.
    pub fn advance_next_index(&mut self, next_index: usize) {
        self.next_index = self.next_index.max(next_index);
    }

    pub fn set_writer(&mut self, writer: Option<RawEpochWriter>) -> Option<RawEpochWriter> {
        std::mem::replace(&mut self.writer, writer)
    }

    pub fn take_writer(&mut self) -> Option<RawEpochWriter> {
        self.writer.take()
    }

    pub fn is_saving(&self) -> bool {
        self.writer.is_some()
    }

    /// Pushes buffered records to disk so the stream can be read back.
    pub fn flush_writer(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Bounds acquisition to a stimulus sequence.
    pub fn arm(&mut self, stimulus_sequence: &[usize], repetition_sequence: &[usize]) {
        self.stimulus_sequence.clear();
        self.stimulus_sequence.extend_from_slice(stimulus_sequence);
        self.repetition_sequence.clear();
        self.repetition_sequence.extend_from_slice(repetition_sequence);
        self.armed = true;
        self.restart();
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.stimulus_sequence.clear();
        self.repetition_sequence.clear();
    }

    pub fn is_exhausted(&self) -> bool {
        self.armed && self.next_index >= self.stimulus_sequence.len()
    }

    /// Drops the partial epoch; its index is re-used by the next epoch.
    fn discard_partial(&mut self) {
        self.write_pos = 0;
    }

    pub fn pause(&mut self) {
        self.discard_partial();
        if self.phase != RecorderPhase::Finished {
            self.phase = RecorderPhase::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.discard_partial();
        if self.phase != RecorderPhase::Finished {
            self.phase = RecorderPhase::Stopped;
        }
    }

    /// Starts (or resumes) acquisition at `next_index`.
    pub fn restart(&mut self) {
        self.discard_partial();
        if let Some(trigger) = self.trigger.as_mut() {
            trigger.reset();
        }
        for filter in self.filters.iter_mut() {
            filter.reset();
        }
        self.phase = if self.is_exhausted() {
            RecorderPhase::Finished
        } else {
            self.start_phase()
        };
    }

    /// Resets counters and sequence; the writer and pool are kept.
    pub fn clear(&mut self) {
        self.next_index = 0;
        self.disarm();
        self.restart();
    }

    // ---- Callback path ----

    pub fn process_block(
        &mut self,
        buffers: &[&[f32]],
        trigger_test_mode: bool,
        thresholds: &Mutex<Vec<f32>>,
        status: &AcquisitionStatus,
    ) {
        let expected = self.num_channels + usize::from(self.trigger.is_some());
        let len = match buffers.first() {
            Some(buffer) => buffer.len(),
            None => {
                status.record_malformed_block();
                return;
            }
        };
        if buffers.len() != expected || buffers.iter().any(|b| b.len() != len) {
            status.record_malformed_block();
            return;
        }

        if trigger_test_mode {
            self.trigger_test(buffers, status);
            return;
        }

        let mut offset = 0;
        while offset < len {
            offset = match self.phase {
                RecorderPhase::SearchingTrigger => self.search_trigger(buffers, offset, status),
                RecorderPhase::Recording => self.record(buffers, offset, thresholds, status),
                RecorderPhase::Paused | RecorderPhase::Stopped | RecorderPhase::Finished => {
                    return
                }
            };
        }
    }

    fn search_trigger(
        &mut self,
        buffers: &[&[f32]],
        offset: usize,
        status: &AcquisitionStatus,
    ) -> usize {
        let Some(trigger) = self.trigger.as_mut() else {
            self.phase = RecorderPhase::Recording;
            return offset;
        };
        let trigger_buffer = buffers[self.num_channels];
        for (i, &sample) in trigger_buffer.iter().enumerate().skip(offset) {
            if trigger.detector.process_sample(sample) {
                self.phase = RecorderPhase::Recording;
                self.write_pos = 0;
                return i;
            }
            trigger.searched += 1;
            if trigger.searched >= trigger.config.search_window_samples {
                status.raise_trigger_fault(TriggerFault::FirstTriggerNotFound);
                self.phase = RecorderPhase::Stopped;
                return trigger_buffer.len();
            }
        }
        trigger_buffer.len()
    }

    fn record(
        &mut self,
        buffers: &[&[f32]],
        offset: usize,
        thresholds: &Mutex<Vec<f32>>,
        status: &AcquisitionStatus,
    ) -> usize {
        let len = buffers[0].len();
        if self.current.is_none() {
            let frame = match self.free_rx.pop() {
                Ok(frame) => frame,
                Err(_) => {
                    status.record_pool_miss();
                    EpochFrame::new(self.num_channels, self.epoch_samples)
                }
            };
            self.current = Some(frame);
        }

        let pos = self.write_pos;
        let take = (len - offset).min(self.epoch_samples - pos);

        if let Some(frame) = self.current.as_mut() {
            for (ch, buffer) in buffers.iter().take(self.num_channels).enumerate() {
                let src = &buffer[offset..offset + take];
                let start = ch * self.epoch_samples + pos;
                let dst = &mut frame.samples[start..start + take];
                match self.filters.get_mut(ch) {
                    Some(filter) => {
                        for (d, &s) in dst.iter_mut().zip(src) {
                            *d = filter.filter_sample(s);
                        }
                    }
                    None => dst.copy_from_slice(src),
                }
            }
        }

        if let Some(trigger) = self.trigger.as_mut() {
            let trigger_samples = &buffers[self.num_channels][offset..offset + take];
            for (k, &sample) in trigger_samples.iter().enumerate() {
                if trigger.detector.process_sample(sample) {
                    // Onsets belong on an epoch boundary
                    let p = pos + k;
                    let deviation = p.min(self.epoch_samples - p);
                    if deviation > trigger.config.jitter_tolerance_samples {
                        status.raise_trigger_fault(TriggerFault::JitterExceeded);
                    }
                }
            }
        }

        self.write_pos += take;
        if self.write_pos == self.epoch_samples {
            self.complete_epoch(thresholds, status);
        }
        offset + take
    }

    fn complete_epoch(&mut self, thresholds: &Mutex<Vec<f32>>, status: &AcquisitionStatus) {
        self.write_pos = 0;
        let Some(mut frame) = self.current.take() else {
            return;
        };

        {
            let live = thresholds.lock().unwrap_or_else(PoisonError::into_inner);
            for (dst, src) in frame.thresholds.iter_mut().zip(live.iter()) {
                *dst = *src;
            }
        }

        // Only this thread pushes, so a free slot now means the push succeeds.
        // A dropped epoch is neither written nor counted.
        if self.pending_tx.is_full() {
            status.raise_queue_overrun();
            self.current = Some(frame);
            self.phase = RecorderPhase::Stopped;
            return;
        }

        let index = self.next_index;
        let (stimulus_index, repetition_index) = if self.armed {
            (
                self.stimulus_sequence.get(index).copied().unwrap_or(0),
                self.repetition_sequence.get(index).copied().unwrap_or(0),
            )
        } else {
            (0, index)
        };

        let write_failed = self
            .writer
            .as_mut()
            .map_or(false, |writer| writer.write_record(&frame.samples).is_err());
        if write_failed {
            // Never keep writing into a failed stream
            self.writer = None;
            status.raise_write_failed();
        }

        let completed = CompletedEpoch {
            index,
            stimulus_index,
            repetition_index,
            frame,
        };
        if let Err(PushError::Full(dropped)) = self.pending_tx.push(completed) {
            status.raise_queue_overrun();
            self.current = Some(dropped.frame);
            self.phase = RecorderPhase::Stopped;
            return;
        }
        status.record_completed();

        self.next_index += 1;
        if self.is_exhausted() {
            self.phase = RecorderPhase::Finished;
            status.set_finished(true);
        }
    }

    fn trigger_test(&mut self, buffers: &[&[f32]], status: &AcquisitionStatus) {
        let epoch_samples = self.epoch_samples as i64;
        let trigger_buffer = buffers[self.num_channels.min(buffers.len() - 1)];
        let Some(trigger) = self.trigger.as_mut() else {
            return;
        };
        for &sample in trigger_buffer {
            trigger.test_clock += 1;
            if trigger.detector.process_sample(sample) {
                if let Some(last) = trigger.test_last_onset {
                    let interval = (trigger.test_clock - last) as i64;
                    let deviation = (interval - epoch_samples).unsigned_abs() as usize;
                    status.record_trigger_test(deviation <= trigger.config.jitter_tolerance_samples);
                }
                trigger.test_last_onset = Some(trigger.test_clock);
            } else if trigger.test_last_onset.is_none()
                && trigger.test_clock >= trigger.config.search_window_samples as u64
            {
                status.raise_trigger_fault(TriggerFault::FirstTriggerNotFound);
            }
        }
    }
}
