use super::FilterInstance;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BandPassFilterConfig {
    pub f_low: f64,
    pub f_high: f64,
}

#[derive(Debug, Clone, Copy)]
enum FilterKind {
    HighPass,
    LowPass,
}

pub struct BandPassFilter {
    high_pass: SecondOrderFilter,
    low_pass: SecondOrderFilter,
}

struct SecondOrderFilter {
    a: [f64; 3],
    b: [f64; 3],
    x: [f64; 2],
    y: [f64; 2],
}

impl SecondOrderFilter {
    fn new(f0: f64, fs: f64, kind: FilterKind) -> Self {
        let q = (2.0f64).sqrt() / 2.0; // Butterworth
        let omega = 2.0 * std::f64::consts::PI * f0 / fs;
        let alpha = f64::sin(omega) / (2.0 * q);
        let cos = f64::cos(omega);

        let (b0, b1, b2) = match kind {
            FilterKind::HighPass => ((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0),
            FilterKind::LowPass => ((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0),
        };

        SecondOrderFilter {
            a: [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
            b: [b0, b1, b2],
            x: [0.0, 0.0],
            y: [0.0, 0.0],
        }
    }

    fn calculate_output(&mut self, input: f64) -> f64 {
        let output = (self.b[0] / self.a[0]) * input
            + (self.b[1] / self.a[0]) * self.x[0]
            + (self.b[2] / self.a[0]) * self.x[1]
            - (self.a[1] / self.a[0]) * self.y[0]
            - (self.a[2] / self.a[0]) * self.y[1];

        // Update internal sample history
        self.x[1] = self.x[0];
        self.x[0] = input;
        self.y[1] = self.y[0];
        self.y[0] = output;

        output
    }

    fn reset(&mut self) {
        self.x = [0.0, 0.0];
        self.y = [0.0, 0.0];
    }
}

impl BandPassFilter {
    pub fn new(config: &BandPassFilterConfig, fs: f64) -> Self {
        BandPassFilter {
            high_pass: SecondOrderFilter::new(config.f_low, fs, FilterKind::HighPass),
            low_pass: SecondOrderFilter::new(config.f_high, fs, FilterKind::LowPass),
        }
    }
}

impl FilterInstance for BandPassFilter {
    fn filter_sample(&mut self, sample: f32) -> f32 {
        // High-pass first, then low-pass on its output
        let high_pass_output = self.high_pass.calculate_output(sample as f64);
        self.low_pass.calculate_output(high_pass_output) as f32
    }

    fn reset(&mut self) {
        self.high_pass.reset();
        self.low_pass.reset();
    }
}
