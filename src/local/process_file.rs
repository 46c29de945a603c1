use crate::config::{Config, SpikeConfig};
use crate::error::Result;
use crate::session::{LoadReport, MeasurementSession, SessionPaths};
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct RescanOptions {
    /// New thresholds applied to every epoch.
    pub thresholds: Option<Vec<f32>>,
    /// New snippet geometry.
    pub geometry: Option<SpikeConfig>,
}

#[derive(Debug, Clone)]
pub struct RescanSummary {
    pub load: LoadReport,
    pub epochs_rescanned: usize,
    pub spikes: usize,
    pub exported: Option<usize>,
    pub elapsed_secs: f64,
}

/// Reloads a saved measurement, optionally re-detects spikes with new
/// thresholds or geometry, and exports the spike table.
pub fn run(
    config: Config,
    paths: SessionPaths,
    options: &RescanOptions,
    csv_output: Option<&Path>,
) -> Result<RescanSummary> {
    let start = Instant::now();
    let mut session = MeasurementSession::new(config)?;
    let load = session.load(paths)?;
    let mut epochs_rescanned = 0;

    if let Some(geometry) = options.geometry {
        let changed = session.spikes_mut().set_spike_length(
            geometry.pre_threshold,
            geometry.post_threshold,
            geometry.spike_length,
        );
        if changed && options.thresholds.is_none() {
            // Stored spikes were dropped; rebuild them from the raw stream
            let thresholds: Vec<Vec<f32>> = session
                .entries()
                .iter()
                .map(|e| e.thresholds.clone().unwrap_or_default())
                .collect();
            for (index, thresholds) in thresholds.iter().enumerate() {
                session.set_epoch_thresholds(index, thresholds)?;
                epochs_rescanned += 1;
            }
        }
    }

    if let Some(thresholds) = &options.thresholds {
        let count = session.entries().len();
        for index in 0..count {
            session.set_epoch_thresholds(index, thresholds)?;
        }
        epochs_rescanned = count;
    }

    let exported = match csv_output {
        Some(path) => Some(session.export_spikes_csv(path)?),
        None => None,
    };

    let summary = RescanSummary {
        load,
        epochs_rescanned,
        spikes: session.spikes().total_spikes(),
        exported,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    log::info!(
        "Rescan: {} epochs, {} rescanned, {} spikes in {:.2} s",
        summary.load.epochs,
        summary.epochs_rescanned,
        summary.spikes,
        summary.elapsed_secs
    );
    Ok(summary)
}
