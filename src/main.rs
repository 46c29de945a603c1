use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use spike_epochs::acquisition::EpochStore;
use spike_epochs::config::{load_config, Config, SpikeConfig};
use spike_epochs::local::process_file::{self, RescanOptions};
use spike_epochs::local::simulator::{spawn_driver, SignalSimulator, SimulatorConfig};
use spike_epochs::session::{MeasurementSession, SessionPaths, SessionState};
use spike_epochs::stimulus::{
    ParameterValue, StimulusDescriptor, StimulusParameter, StimulusSetDescriptor,
};
use spike_epochs::utils::log::{init_logging, log_with_header};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const RUN_LOG: &str = "runs.log";

#[derive(Parser)]
#[command(name = "spike-epochs", version, about = "Epoch acquisition and spike detection")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a measurement against the built-in signal simulator
    Simulate {
        /// Stimulus set descriptor (YAML); five tones if omitted
        #[arg(long)]
        stimuli: Option<PathBuf>,
        /// Directory for the raw stream and index
        #[arg(long, default_value = "measurements")]
        out_dir: PathBuf,
        #[arg(long, default_value = "simulated")]
        name: String,
        /// Pause and resume once after this many epochs
        #[arg(long)]
        pause_after: Option<usize>,
        /// Continue an existing measurement instead of starting a new one
        #[arg(long)]
        resume: bool,
        /// Write the spike table to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,
        /// Simulation speed relative to real time
        #[arg(long, default_value_t = 10.0)]
        speed: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check trigger interval stability without recording epochs
    TriggerTest {
        #[arg(long, default_value_t = 200)]
        blocks: usize,
        /// Maximum simulated trigger delay in samples
        #[arg(long, default_value_t = 0)]
        jitter: usize,
    },
    /// Reload a saved measurement and re-detect spikes
    Rescan {
        #[arg(long, default_value = "measurements")]
        dir: PathBuf,
        #[arg(long, default_value = "simulated")]
        name: String,
        /// New thresholds, one per channel
        #[arg(long, num_args = 1.., allow_negative_numbers = true)]
        threshold: Option<Vec<f32>>,
        /// New snippet geometry: pre, post and spike length in samples
        #[arg(long, num_args = 3)]
        geometry: Option<Vec<usize>>,
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config.logging, cli.verbose).context("Failed to set up logging")?;

    match cli.command {
        Commands::Simulate {
            stimuli,
            out_dir,
            name,
            pause_after,
            resume,
            export,
            speed,
            seed,
        } => {
            if config.acquisition.thresholds.is_empty() {
                config.acquisition.thresholds = vec![0.5; config.acquisition.num_channels];
            }
            if let Some(seed) = seed {
                config.sequence.seed = Some(seed);
            }
            let descriptor = match &stimuli {
                Some(path) => StimulusSetDescriptor::from_file(path)
                    .with_context(|| format!("Failed to read stimuli {}", path.display()))?,
                None => default_stimuli(config.acquisition.epoch_samples / 2),
            };
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {}", out_dir.display()))?;
            let paths = SessionPaths::new(&out_dir, &name);

            let sim_config = SimulatorConfig {
                trigger: config.acquisition.trigger.is_some(),
                speed,
                seed,
                ..SimulatorConfig::default()
            };
            let summary = simulate(config.clone(), &descriptor, paths, resume, pause_after, sim_config, export)?;
            if config.logging.log_file.is_some() {
                log_with_header(RUN_LOG, "simulate", &summary).context("Failed to write run log")?;
            }
        }

        Commands::TriggerTest { blocks, jitter } => {
            let Some(trigger) = config.acquisition.trigger.clone() else {
                bail!("Trigger test needs a trigger section in the acquisition config");
            };
            let store = Arc::new(EpochStore::new(&config.acquisition).context("Invalid acquisition config")?);
            let simulator = SignalSimulator::new(
                SimulatorConfig {
                    trigger: true,
                    trigger_jitter_samples: jitter,
                    speed: 0.0,
                    ..SimulatorConfig::default()
                },
                config.acquisition.num_channels,
                config.acquisition.epoch_samples,
                config.acquisition.sample_rate,
            );
            let stop = Arc::new(AtomicBool::new(false));
            let delivered = spawn_driver(Arc::clone(&store), simulator, true, Some(blocks), stop)
                .join()
                .map_err(|_| anyhow::anyhow!("Driver thread panicked"))?;

            let status = store.status();
            println!(
                "Trigger test: {} blocks, tolerance {} samples",
                delivered, trigger.jitter_tolerance_samples
            );
            println!("  {} {}", "passed".green(), status.trigger_tests_passed);
            println!("  {} {}", "failed".red(), status.trigger_tests_failed);
            if let Some(fault) = status.trigger_fault {
                println!("  {}", fault.to_string().red().bold());
            }
        }

        Commands::Rescan {
            dir,
            name,
            threshold,
            geometry,
            export,
        } => {
            let options = RescanOptions {
                thresholds: threshold,
                geometry: geometry.map(|g| SpikeConfig {
                    pre_threshold: g[0],
                    post_threshold: g[1],
                    spike_length: g[2],
                }),
            };
            let paths = SessionPaths::new(&dir, &name);
            let summary = process_file::run(config, paths, &options, export.as_deref())
                .context("Rescan failed")?;
            println!(
                "{} {} epochs, {} rescanned, {} spikes ({:.2} s)",
                "Rescan complete:".green().bold(),
                summary.load.epochs,
                summary.epochs_rescanned,
                summary.spikes,
                summary.elapsed_secs
            );
            if !summary.load.substituted_thresholds.is_empty() {
                println!(
                    "{} {} epochs used the global thresholds",
                    "warning:".yellow(),
                    summary.load.substituted_thresholds.len()
                );
            }
            if let Some(rows) = summary.exported {
                println!("Exported {} spikes", rows);
            }
        }
    }

    Ok(())
}

fn simulate(
    config: Config,
    descriptor: &StimulusSetDescriptor,
    paths: SessionPaths,
    resume: bool,
    pause_after: Option<usize>,
    sim_config: SimulatorConfig,
    export: Option<PathBuf>,
) -> Result<String> {
    let mut session = MeasurementSession::new(config).context("Invalid configuration")?;
    if resume {
        let report = session
            .resume_from(paths)
            .context("Failed to resume measurement")?;
        println!("Resumed after {} epochs", report.epochs);
        session.resume()?;
    } else {
        session.set_stimuli(descriptor).context("Invalid stimulus set")?;
        session.start(Some(paths)).context("Failed to start measurement")?;
    }

    let acquisition = &session.config().acquisition;
    let simulator = SignalSimulator::new(
        sim_config,
        acquisition.num_channels,
        acquisition.epoch_samples,
        acquisition.sample_rate,
    );
    let stop = Arc::new(AtomicBool::new(false));
    let driver = spawn_driver(session.epoch_store(), simulator, false, None, Arc::clone(&stop));

    let outcome = run_measurement(&mut session, pause_after);
    stop.store(true, Ordering::Relaxed);
    let blocks = driver
        .join()
        .map_err(|_| anyhow::anyhow!("Driver thread panicked"))?;
    outcome?;

    let summary = format!(
        "{} epochs of {}, {} spikes, {} blocks delivered",
        session.entries().len(),
        session.sequence().len(),
        session.spikes().total_spikes(),
        blocks
    );
    println!("{} {}", "Measurement complete:".green().bold(), summary);

    if let Some(path) = export {
        let rows = session
            .export_spikes_csv(&path)
            .with_context(|| format!("Failed to export {}", path.display()))?;
        println!("Exported {} spikes to {}", rows, path.display());
    }
    Ok(summary)
}

/// Control loop: poll after every cycle, drain epochs, stop on faults.
fn run_measurement(session: &mut MeasurementSession, pause_after: Option<usize>) -> Result<()> {
    let mut paused_once = false;
    while session.state() != SessionState::Finished {
        thread::sleep(POLL_INTERVAL);
        session.poll().context("Acquisition stopped")?;
        session.process_pending()?;

        if let Some(n) = pause_after {
            if !paused_once && session.entries().len() >= n && session.state() == SessionState::Running {
                session.pause()?;
                println!("{} after {} epochs", "Paused".yellow(), session.entries().len());
                thread::sleep(POLL_INTERVAL * 20);
                session.resume()?;
                println!("{}", "Resumed".yellow());
                paused_once = true;
            }
        }
    }
    Ok(())
}

fn default_stimuli(num_samples: usize) -> StimulusSetDescriptor {
    StimulusSetDescriptor {
        parameters: vec![StimulusParameter {
            name: "frequency".into(),
            unit: "Hz".into(),
            options: Vec::new(),
        }],
        stimuli: [500.0, 1000.0, 2000.0, 4000.0, 8000.0]
            .iter()
            .enumerate()
            .map(|(i, &f)| StimulusDescriptor {
                id: format!("tone{}", i + 1),
                name: Some(format!("Tone {} Hz", f)),
                num_samples,
                num_output_channels: 1,
                values: vec![ParameterValue::Number(f)],
            })
            .collect(),
    }
}
