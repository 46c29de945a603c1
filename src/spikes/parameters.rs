//! Scalar features computed for every extracted spike waveform.
//!
//! Positions are reported in milliseconds relative to the threshold
//! crossing, which sits `pre_threshold` samples into the snippet.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpikeParameter {
    MaxAmplitude,
    MinAmplitude,
    PeakToPeak,
    MaxPosition,
    MinPosition,
    PeakDistance,
    Energy,
    Area,
}

impl SpikeParameter {
    pub const ALL: [SpikeParameter; 8] = [
        SpikeParameter::MaxAmplitude,
        SpikeParameter::MinAmplitude,
        SpikeParameter::PeakToPeak,
        SpikeParameter::MaxPosition,
        SpikeParameter::MinPosition,
        SpikeParameter::PeakDistance,
        SpikeParameter::Energy,
        SpikeParameter::Area,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Position of this parameter in every spike's feature vector.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn id(self) -> &'static str {
        match self {
            SpikeParameter::MaxAmplitude => "max_amplitude",
            SpikeParameter::MinAmplitude => "min_amplitude",
            SpikeParameter::PeakToPeak => "peak_to_peak",
            SpikeParameter::MaxPosition => "max_position",
            SpikeParameter::MinPosition => "min_position",
            SpikeParameter::PeakDistance => "peak_distance",
            SpikeParameter::Energy => "energy",
            SpikeParameter::Area => "area",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpikeParameter::MaxAmplitude => "Maximum amplitude",
            SpikeParameter::MinAmplitude => "Minimum amplitude",
            SpikeParameter::PeakToPeak => "Total amplitude",
            SpikeParameter::MaxPosition => "Position of maximum",
            SpikeParameter::MinPosition => "Position of minimum",
            SpikeParameter::PeakDistance => "Peak distance",
            SpikeParameter::Energy => "Energy",
            SpikeParameter::Area => "Area",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SpikeParameter::MaxAmplitude
            | SpikeParameter::MinAmplitude
            | SpikeParameter::PeakToPeak => "V",
            SpikeParameter::MaxPosition
            | SpikeParameter::MinPosition
            | SpikeParameter::PeakDistance => "ms",
            SpikeParameter::Energy => "V²s",
            SpikeParameter::Area => "Vs",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.id() == id)
    }

    pub fn compute(self, waveform: &[f32], crossing: usize, sample_rate: f64) -> f64 {
        let extrema = Extrema::of(waveform);
        let to_ms = |samples: f64| samples * 1000.0 / sample_rate;
        match self {
            SpikeParameter::MaxAmplitude => extrema.max as f64,
            SpikeParameter::MinAmplitude => extrema.min as f64,
            SpikeParameter::PeakToPeak => (extrema.max - extrema.min) as f64,
            SpikeParameter::MaxPosition => to_ms(extrema.max_pos as f64 - crossing as f64),
            SpikeParameter::MinPosition => to_ms(extrema.min_pos as f64 - crossing as f64),
            SpikeParameter::PeakDistance => {
                to_ms((extrema.max_pos as f64 - extrema.min_pos as f64).abs())
            }
            SpikeParameter::Energy => {
                waveform.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / sample_rate
            }
            SpikeParameter::Area => {
                waveform.iter().map(|&s| (s as f64).abs()).sum::<f64>() / sample_rate
            }
        }
    }
}

struct Extrema {
    max: f32,
    min: f32,
    max_pos: usize,
    min_pos: usize,
}

impl Extrema {
    fn of(waveform: &[f32]) -> Self {
        let mut extrema = Extrema {
            max: f32::NEG_INFINITY,
            min: f32::INFINITY,
            max_pos: 0,
            min_pos: 0,
        };
        for (i, &s) in waveform.iter().enumerate() {
            if s > extrema.max {
                extrema.max = s;
                extrema.max_pos = i;
            }
            if s < extrema.min {
                extrema.min = s;
                extrema.min_pos = i;
            }
        }
        if waveform.is_empty() {
            extrema.max = 0.0;
            extrema.min = 0.0;
        }
        extrema
    }
}

/// Computes the full feature vector, ordered as [`SpikeParameter::ALL`].
pub fn compute_all(waveform: &[f32], crossing: usize, sample_rate: f64) -> Vec<f64> {
    SpikeParameter::ALL
        .iter()
        .map(|p| p.compute(waveform, crossing, sample_rate))
        .collect()
}
