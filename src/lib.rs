//! Real-time epoch segmentation, spike detection and raw epoch persistence
//! for auditory neurophysiology measurements.
//!
//! The sound driver calls [`acquisition::EpochStore::sound_proc`] once per
//! audio block; the control thread drives a [`session::MeasurementSession`]
//! that drains completed epochs into the [`spikes::SpikeStore`].

pub mod acquisition;
pub mod bindings;
pub mod config;
pub mod error;
pub mod local;
pub mod processing;
pub mod session;
pub mod spikes;
pub mod stimulus;
pub mod utils;

pub use error::{Error, Result};
