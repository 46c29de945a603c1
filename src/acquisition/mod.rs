pub mod epoch;
pub mod raw_file;
mod recorder;
pub mod status;
pub mod store;

pub use epoch::{Epoch, EpochData};
pub use raw_file::{count_records, record_bytes, RawEpochReader, RawEpochWriter};
pub use recorder::RecorderPhase;
pub use status::{AcquisitionStatus, StatusSnapshot};
pub use store::EpochStore;
