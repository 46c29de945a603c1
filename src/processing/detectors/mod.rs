pub mod threshold;

pub use threshold::{CrossingDirection, ThresholdCrossingDetector};
