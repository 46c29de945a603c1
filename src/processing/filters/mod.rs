pub mod bandpass;

/// Per-channel sample filter run on the callback thread. Implementations must
/// not allocate in `filter_sample`.
pub trait FilterInstance: Send {
    fn filter_sample(&mut self, sample: f32) -> f32;
    fn reset(&mut self);
}
