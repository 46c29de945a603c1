pub mod pulse;

pub trait TriggerInstance: Send {
    /// Feeds one trigger-channel sample, returns true on a stimulus onset.
    fn process_sample(&mut self, sample: f32) -> bool;
    fn reset(&mut self);
}
