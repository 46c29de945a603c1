pub mod index;

pub use index::{EpochEntry, EpochIndex};

use crate::acquisition::{count_records, EpochStore, RawEpochReader, StatusSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::spikes::{SpikeParameter, SpikeStore};
use crate::stimulus::{AddMode, StimulusCatalog, StimulusSequence, StimulusSetDescriptor};

use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Raw stream and index document of one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub raw: PathBuf,
    pub index: PathBuf,
}

impl SessionPaths {
    /// `<dir>/<name>.bin` and `<dir>/<name>.yaml`.
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            raw: dir.join(format!("{}.bin", name)),
            index: dir.join(format!("{}.yaml", name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopped,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub epochs: usize,
    pub spikes: usize,
    /// Epochs whose thresholds were missing and replaced by the global ones.
    pub substituted_thresholds: Vec<usize>,
}

/// Explicit measurement context: owns the stores, the stimulus catalog and
/// sequence, and keeps the epoch index in step with the raw stream.
pub struct MeasurementSession {
    config: Config,
    epochs: Arc<EpochStore>,
    spikes: SpikeStore,
    catalog: StimulusCatalog,
    sequence: StimulusSequence,
    entries: Vec<EpochEntry>,
    paths: Option<SessionPaths>,
    created: DateTime<Local>,
    state: SessionState,
    rng: StdRng,
}

impl MeasurementSession {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let epochs = Arc::new(EpochStore::new(&config.acquisition)?);
        let spikes = SpikeStore::new(
            config.acquisition.num_channels,
            config.acquisition.sample_rate,
            config.spikes,
        );
        let rng = match config.sequence.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            epochs,
            spikes,
            catalog: StimulusCatalog::new(),
            sequence: StimulusSequence::default(),
            entries: Vec::new(),
            paths: None,
            created: Local::now(),
            state: SessionState::Idle,
            rng,
        })
    }

    // ---- Accessors ----

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for the driver thread, which calls [`EpochStore::sound_proc`].
    pub fn epoch_store(&self) -> Arc<EpochStore> {
        Arc::clone(&self.epochs)
    }

    pub fn spikes(&self) -> &SpikeStore {
        &self.spikes
    }

    pub fn spikes_mut(&mut self) -> &mut SpikeStore {
        &mut self.spikes
    }

    pub fn catalog(&self) -> &StimulusCatalog {
        &self.catalog
    }

    pub fn sequence(&self) -> &StimulusSequence {
        &self.sequence
    }

    pub fn entries(&self) -> &[EpochEntry] {
        &self.entries
    }

    pub fn paths(&self) -> Option<&SessionPaths> {
        self.paths.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every epoch of the sequence has been collected.
    pub fn is_complete(&self) -> bool {
        !self.sequence.is_empty() && self.entries.len() >= self.sequence.len()
    }

    // ---- Stimuli ----

    /// Replaces the stimulus catalog. Only allowed before a measurement starts.
    pub fn set_stimuli(&mut self, descriptor: &StimulusSetDescriptor) -> Result<()> {
        if self.state == SessionState::Running || self.state == SessionState::Paused {
            return Err(Error::Configuration(
                "stimuli cannot be replaced during a measurement".into(),
            ));
        }
        self.catalog.add(
            descriptor,
            self.config.acquisition.epoch_samples,
            self.config.acquisition.output_channels,
            AddMode::Replace,
        )?;
        Ok(())
    }

    /// Appends stimuli to the running or loaded measurement and extends the
    /// sequence with `repetitions` blocks of them. Existing indices are kept.
    pub fn append_stimuli(
        &mut self,
        descriptor: &StimulusSetDescriptor,
        repetitions: usize,
    ) -> Result<Range<usize>> {
        let added = self.catalog.add(
            descriptor,
            self.config.acquisition.epoch_samples,
            self.config.acquisition.output_channels,
            AddMode::Append,
        )?;
        self.sequence.append(
            added.start,
            added.len(),
            repetitions,
            self.config.sequence.randomize,
            &mut self.rng,
        );
        self.rearm()?;
        log::info!(
            "Appended {} stimuli x {} repetitions, sequence now {} epochs",
            added.len(),
            repetitions,
            self.sequence.len()
        );
        self.save_index()?;
        Ok(added)
    }

    fn rearm(&mut self) -> Result<()> {
        if self.state == SessionState::Finished {
            // The raw stream was closed when the sequence ran out
            if let Some(paths) = &self.paths {
                self.epochs.append_save(&paths.raw)?;
            }
            self.state = SessionState::Paused;
        }
        self.epochs.arm(&self.sequence);
        if self.state != SessionState::Running {
            self.epochs.pause();
        }
        Ok(())
    }

    // ---- Acquisition control ----

    /// Starts a fresh measurement over the loaded stimuli. With `paths`, the
    /// raw stream is truncated and the index written alongside.
    pub fn start(&mut self, paths: Option<SessionPaths>) -> Result<()> {
        if self.catalog.is_empty() {
            return Err(Error::Configuration("no stimuli loaded".into()));
        }
        self.epochs.clear();
        self.spikes.clear();
        self.entries.clear();
        self.sequence = StimulusSequence::build(
            self.catalog.len(),
            self.config.sequence.repetitions,
            self.config.sequence.randomize,
            &mut self.rng,
        );
        self.created = Local::now();

        if let Some(paths) = &paths {
            self.epochs.init_save(&paths.raw)?;
        }
        self.paths = paths;
        self.save_index()?;

        self.epochs.arm(&self.sequence);
        self.state = SessionState::Running;
        log::info!(
            "Measurement started: {} stimuli x {} repetitions = {} epochs",
            self.catalog.len(),
            self.config.sequence.repetitions,
            self.sequence.len()
        );
        Ok(())
    }

    /// Drains completed epochs: spikes are extracted and the index grows.
    /// Returns the number of epochs processed.
    pub fn process_pending(&mut self) -> Result<usize> {
        let mut processed = 0;
        while let Some((epoch, is_last)) = self.epochs.pop() {
            self.spikes.add(&epoch)?;
            self.entries.push(EpochEntry {
                index: epoch.index,
                done: epoch.is_done(),
                thresholds: Some(epoch.thresholds.clone()),
            });
            processed += 1;
            if is_last {
                break;
            }
        }

        if self.state == SessionState::Running
            && self.is_complete()
            && self.epochs.pending_count() == 0
        {
            self.finish()?;
        }
        Ok(processed)
    }

    fn finish(&mut self) -> Result<()> {
        self.close_save()?;
        self.state = SessionState::Finished;
        log::info!(
            "Measurement complete: {} epochs, {} spikes",
            self.entries.len(),
            self.spikes.total_spikes()
        );
        Ok(())
    }

    /// Polls the callback status. A fault stops the measurement and is
    /// returned as the error.
    pub fn poll(&mut self) -> Result<StatusSnapshot> {
        let status = self.epochs.status();
        if let Err(fault) = status.check() {
            log::error!("Acquisition fault: {}", fault);
            if let Err(e) = self.stop() {
                log::error!("Stopping after fault failed: {}", e);
            }
            return Err(fault);
        }
        Ok(status)
    }

    /// Halts acquisition, keeping the save session open. The partial epoch
    /// is discarded and re-recorded after [`MeasurementSession::resume`].
    pub fn pause(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Ok(());
        }
        self.epochs.pause();
        self.process_pending()?;
        self.save_index()?;
        self.state = SessionState::Paused;
        log::info!("Measurement paused after {} epochs", self.entries.len());
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != SessionState::Paused {
            return Ok(());
        }
        self.epochs.resume();
        self.state = SessionState::Running;
        log::info!("Measurement resumed at epoch {}", self.epochs.next_index());
        Ok(())
    }

    /// Stops acquisition, drains the queue and closes the save session.
    pub fn stop(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Idle | SessionState::Stopped | SessionState::Finished) {
            return Ok(());
        }
        self.epochs.stop();
        self.process_pending()?;
        if self.state != SessionState::Finished {
            self.close_save()?;
            self.state = SessionState::Stopped;
            log::info!("Measurement stopped after {} epochs", self.entries.len());
        }
        Ok(())
    }

    fn close_save(&mut self) -> Result<()> {
        if self.paths.is_some() {
            let written = self.epochs.done_save()?;
            log::debug!("Raw stream closed with {} records this session", written);
        }
        self.save_index()
    }

    // ---- Thresholds ----

    /// Re-detects one epoch with new thresholds ("set and reset"). Raw data
    /// released from memory is read back from the raw stream. Nothing is
    /// changed unless the samples are available.
    pub fn set_epoch_thresholds(&mut self, index: usize, thresholds: &[f32]) -> Result<usize> {
        let current = self.epochs.get(Some(index)).ok_or(Error::EpochNotFound(index))?;
        if thresholds.len() != current.thresholds.len() {
            return Err(Error::ThresholdLength {
                expected: current.thresholds.len(),
                found: thresholds.len(),
            });
        }
        let released = if current.has_data() {
            None
        } else {
            let paths = self.paths.as_ref().ok_or(Error::EpochDataReleased(index))?;
            // Records of a running measurement may still sit in the write buffer
            self.epochs.flush_save()?;
            let mut reader = RawEpochReader::open(
                &paths.raw,
                self.epochs.num_channels(),
                self.epochs.epoch_samples(),
            )?;
            Some(reader.read_record_at(index)?)
        };

        let mut epoch = self.epochs.set_epoch_thresholds(index, thresholds)?;
        if let Some(samples) = released {
            epoch = epoch.with_samples(samples, self.epochs.epoch_samples())?;
        }

        for channel in 0..self.spikes.num_channels() {
            self.spikes.remove(channel, index)?;
        }
        let found = self.spikes.add(&epoch)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) {
            entry.thresholds = Some(thresholds.to_vec());
        }
        self.save_index()?;
        Ok(found)
    }

    // ---- Persistence ----

    fn build_index(&self) -> EpochIndex {
        EpochIndex {
            created: self.created,
            sample_rate: self.epochs.sample_rate(),
            num_channels: self.epochs.num_channels(),
            epoch_samples: self.epochs.epoch_samples(),
            spikes: self.spikes.geometry(),
            thresholds: self.epochs.thresholds(),
            stimuli: self.catalog.to_descriptor(),
            stimulus_sequence: self.sequence.stimuli().to_vec(),
            repetition_sequence: self.sequence.repetitions().to_vec(),
            epoches: self.entries.clone(),
        }
    }

    /// Writes the index document if the session has paths.
    pub fn save_index(&self) -> Result<()> {
        if let Some(paths) = &self.paths {
            self.build_index().save(&paths.index)?;
        }
        Ok(())
    }

    /// Rebuilds the session from a saved measurement. On failure all
    /// partially loaded state is discarded.
    pub fn load(&mut self, paths: SessionPaths) -> Result<LoadReport> {
        match self.load_inner(&paths) {
            Ok(report) => {
                self.paths = Some(paths);
                self.state = SessionState::Stopped;
                Ok(report)
            }
            Err(e) => {
                log::error!("Loading {} failed: {}", paths.index.display(), e);
                self.cleanup();
                Err(e)
            }
        }
    }

    fn load_inner(&mut self, paths: &SessionPaths) -> Result<LoadReport> {
        let index = EpochIndex::load(&paths.index)?;
        if (index.sample_rate - self.epochs.sample_rate()).abs() > f64::EPSILON {
            return Err(Error::DataConsistency(format!(
                "measurement was recorded at {} Hz, session runs at {} Hz",
                index.sample_rate,
                self.epochs.sample_rate()
            )));
        }

        let records = count_records(&paths.raw, index.num_channels, index.epoch_samples)?;
        if records != index.completed_epochs() {
            return Err(Error::DataConsistency(format!(
                "raw stream holds {} epochs, index lists {} completed",
                records,
                index.completed_epochs()
            )));
        }

        self.cleanup();
        self.epochs.initialize(index.num_channels, index.epoch_samples)?;
        self.epochs.load_thresholds(&index.thresholds)?;
        self.spikes.set_num_channels(index.num_channels);
        self.spikes.set_spike_length(
            index.spikes.pre_threshold,
            index.spikes.post_threshold,
            index.spikes.spike_length,
        );
        self.catalog.add(
            &index.stimuli,
            index.epoch_samples,
            self.config.acquisition.output_channels,
            AddMode::Replace,
        )?;
        self.sequence =
            StimulusSequence::from_parts(index.stimulus_sequence.clone(), index.repetition_sequence.clone())?;
        self.created = index.created;

        let mut report = LoadReport::default();
        let mut reader = RawEpochReader::open(&paths.raw, index.num_channels, index.epoch_samples)?;
        for entry in index.epoches.iter().filter(|e| e.done) {
            let samples = reader.read_record()?.ok_or_else(|| {
                Error::DataConsistency(format!("raw stream ends before epoch {}", entry.index))
            })?;
            let thresholds = match &entry.thresholds {
                Some(thresholds) => thresholds.clone(),
                None => {
                    report.substituted_thresholds.push(entry.index);
                    index.thresholds.clone()
                }
            };
            let (stimulus, repetition) = self
                .sequence
                .get(entry.index)
                .ok_or(Error::EpochNotFound(entry.index))?;
            let epoch = self.epochs.push(samples, thresholds.clone(), stimulus, repetition)?;
            if epoch.index != entry.index {
                return Err(Error::DataConsistency(format!(
                    "epoch {} reloaded as {}",
                    entry.index, epoch.index
                )));
            }
            report.spikes += self.spikes.add(&epoch)?;
            self.entries.push(EpochEntry {
                index: entry.index,
                done: true,
                thresholds: Some(thresholds),
            });
            report.epochs += 1;
        }

        if !report.substituted_thresholds.is_empty() {
            log::warn!(
                "{} epochs had no stored thresholds; global thresholds used",
                report.substituted_thresholds.len()
            );
        }
        log::info!(
            "Loaded {} epochs ({} spikes) from {}",
            report.epochs,
            report.spikes,
            paths.index.display()
        );
        Ok(report)
    }

    /// Loads a measurement and reopens its raw stream so acquisition
    /// continues the global epoch index.
    pub fn resume_from(&mut self, paths: SessionPaths) -> Result<LoadReport> {
        let report = self.load(paths.clone())?;
        let existing = match self.epochs.append_save(&paths.raw) {
            Ok(existing) => existing,
            Err(e) => {
                self.cleanup();
                return Err(e);
            }
        };
        if existing != report.epochs {
            self.cleanup();
            return Err(Error::DataConsistency(format!(
                "raw stream holds {} epochs after reload of {}",
                existing, report.epochs
            )));
        }

        self.epochs.arm(&self.sequence);
        if self.is_complete() {
            self.state = SessionState::Finished;
            self.close_save()?;
        } else {
            self.epochs.pause();
            self.state = SessionState::Paused;
        }
        log::info!(
            "Resuming measurement at epoch {} of {}",
            self.epochs.next_index(),
            self.sequence.len()
        );
        Ok(report)
    }

    /// Drops all measurement state without touching files.
    pub fn cleanup(&mut self) {
        if self.epochs.is_saving() {
            if let Err(e) = self.epochs.done_save() {
                log::warn!("Closing raw stream during cleanup failed: {}", e);
            }
        }
        self.epochs.clear();
        self.spikes.clear();
        self.catalog.clear();
        self.sequence.clear();
        self.entries.clear();
        self.paths = None;
        self.state = SessionState::Idle;
    }

    /// Writes one row per spike. Returns the number of rows.
    pub fn export_spikes_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        let mut header = vec![
            "channel".to_string(),
            "epoch".into(),
            "stimulus".into(),
            "stimulus_id".into(),
            "repetition".into(),
            "position".into(),
            "time".into(),
            "threshold".into(),
            "group".into(),
        ];
        header.extend(SpikeParameter::ALL.iter().map(|p| p.id().to_string()));
        writer.write_record(&header)?;

        let mut rows = 0;
        for channel in 0..self.spikes.num_channels() {
            for spike in self.spikes.spikes(channel)? {
                let stimulus_id = self
                    .catalog
                    .get(spike.stimulus_index)
                    .map(|s| s.id.as_str())
                    .unwrap_or("");
                let mut record = vec![
                    spike.channel.to_string(),
                    spike.epoch_index.to_string(),
                    spike.stimulus_index.to_string(),
                    stimulus_id.to_string(),
                    spike.repetition_index.to_string(),
                    spike.position.to_string(),
                    format!("{:.6}", spike.time),
                    spike.threshold.to_string(),
                    spike.group.to_string(),
                ];
                record.extend(spike.features.iter().map(|v| v.to_string()));
                writer.write_record(&record)?;
                rows += 1;
            }
        }
        writer.flush()?;
        log::info!("Exported {} spikes to {}", rows, path.as_ref().display());
        Ok(rows)
    }
}
