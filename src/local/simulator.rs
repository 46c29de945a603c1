use crate::acquisition::EpochStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// -----------------------------------------------------------------------------
// SIMULATED SIGNALS
// -----------------------------------------------------------------------------

const SPIKE_WIDTH: usize = 12;
const TRIGGER_WIDTH: usize = 10;
const TRIGGER_AMPLITUDE: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub block_size: usize,
    /// Mean spike rate per channel.
    pub spike_rate_hz: f64,
    pub spike_amplitude: f32,
    pub noise_amplitude: f32,
    /// Emit a trigger channel with one pulse per epoch.
    pub trigger: bool,
    /// Maximum random delay of each trigger pulse after its epoch boundary.
    pub trigger_jitter_samples: usize,
    /// Playback speed relative to real time; 0 disables pacing.
    pub speed: f64,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            spike_rate_hz: 20.0,
            spike_amplitude: 1.0,
            noise_amplitude: 0.05,
            trigger: false,
            trigger_jitter_samples: 0,
            speed: 10.0,
            seed: None,
        }
    }
}

/// Deinterleaved noise + spike blocks as a sound driver would deliver them.
pub struct SignalSimulator {
    config: SimulatorConfig,
    num_channels: usize,
    epoch_samples: usize,
    sample_rate: f64,
    rng: StdRng,
    clock: u64,
    spike_phase: Vec<Option<usize>>,
    period: u64,
    next_onset: u64,
    trigger_remaining: usize,
}

impl SignalSimulator {
    pub fn new(
        config: SimulatorConfig,
        num_channels: usize,
        epoch_samples: usize,
        sample_rate: f64,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            num_channels,
            epoch_samples,
            sample_rate,
            rng,
            clock: 0,
            spike_phase: vec![None; num_channels],
            period: 0,
            next_onset: 0,
            trigger_remaining: 0,
        }
    }

    /// Number of buffers per block: recording channels plus the trigger.
    pub fn num_buffers(&self) -> usize {
        self.num_channels + usize::from(self.config.trigger)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.config.block_size as f64 / self.sample_rate)
    }

    /// Fills `buffers` (one per [`SignalSimulator::num_buffers`]) with the next block.
    pub fn fill_block(&mut self, buffers: &mut [Vec<f32>]) {
        let block_size = self.config.block_size;
        for buffer in buffers.iter_mut() {
            buffer.resize(block_size, 0.0);
        }
        let spike_probability = (self.config.spike_rate_hz / self.sample_rate).clamp(0.0, 1.0);

        for i in 0..block_size {
            for ch in 0..self.num_channels {
                let noise = self.config.noise_amplitude * self.rng.gen_range(-1.0f32..1.0);
                if self.spike_phase[ch].is_none() && self.rng.gen_bool(spike_probability) {
                    self.spike_phase[ch] = Some(0);
                }
                let spike = match self.spike_phase[ch] {
                    Some(k) => {
                        self.spike_phase[ch] = (k + 1 < SPIKE_WIDTH).then_some(k + 1);
                        spike_shape(k) * self.config.spike_amplitude
                    }
                    None => 0.0,
                };
                buffers[ch][i] = noise + spike;
            }

            if self.config.trigger {
                buffers[self.num_channels][i] = self.trigger_sample();
            }
            self.clock += 1;
        }
    }

    fn trigger_sample(&mut self) -> f32 {
        if self.clock == self.next_onset {
            self.trigger_remaining = TRIGGER_WIDTH;
            self.period += 1;
            let jitter = match self.config.trigger_jitter_samples {
                0 => 0,
                max => self.rng.gen_range(0..=max as u64),
            };
            self.next_onset = self.period * self.epoch_samples as u64 + jitter;
        }
        if self.trigger_remaining > 0 {
            self.trigger_remaining -= 1;
            TRIGGER_AMPLITUDE
        } else {
            0.0
        }
    }
}

/// Biphasic spike: positive half-sine then a smaller negative lobe.
fn spike_shape(k: usize) -> f32 {
    let half = SPIKE_WIDTH / 2;
    if k < half {
        (PI * k as f32 / half as f32).sin()
    } else {
        -0.4 * (PI * (k - half) as f32 / half as f32).sin()
    }
}

// -----------------------------------------------------------------------------
// DRIVER THREAD
// -----------------------------------------------------------------------------

/// Calls `sound_proc` from its own thread until `stop` is set or `max_blocks`
/// blocks were delivered. Returns the number of blocks delivered.
pub fn spawn_driver(
    store: Arc<EpochStore>,
    mut simulator: SignalSimulator,
    trigger_test_mode: bool,
    max_blocks: Option<usize>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<usize> {
    thread::spawn(move || {
        let mut buffers = vec![Vec::new(); simulator.num_buffers()];
        let pacing = match simulator.config.speed {
            speed if speed > 0.0 => Some(simulator.block_duration().div_f64(speed)),
            _ => None,
        };

        let mut delivered = 0;
        while !stop.load(Ordering::Relaxed) && max_blocks.map_or(true, |max| delivered < max) {
            simulator.fill_block(&mut buffers);
            let views: Vec<&[f32]> = buffers.iter().map(|b| b.as_slice()).collect();
            store.sound_proc(&views, trigger_test_mode);
            delivered += 1;

            if let Some(pause) = pacing {
                thread::sleep(pause);
            }
        }
        delivered
    })
}
