pub mod detectors;
pub mod filters;
pub mod triggers;
