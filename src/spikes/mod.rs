pub mod parameters;
pub mod store;

pub use parameters::SpikeParameter;
pub use store::SpikeStore;

/// Group id of spikes not assigned to any cluster.
pub const UNASSIGNED_GROUP: i32 = -1;

/// One detected threshold crossing with its snippet and features.
#[derive(Debug, Clone, PartialEq)]
pub struct Spike {
    pub channel: usize,
    /// Sample offset of the crossing inside its epoch.
    pub position: usize,
    /// Seconds since measurement start.
    pub time: f64,
    pub waveform: Vec<f32>,
    pub threshold: f32,
    pub stimulus_index: usize,
    pub epoch_index: usize,
    pub repetition_index: usize,
    /// Ordered as [`SpikeParameter::ALL`].
    pub features: Vec<f64>,
    pub group: i32,
}

impl Spike {
    pub fn param(&self, which: SpikeParameter) -> f64 {
        self.features[which.index()]
    }
}
