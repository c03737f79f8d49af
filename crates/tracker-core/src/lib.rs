pub mod drives;
pub mod error;
pub mod identity;
pub mod paths;
pub mod record;
pub mod scrub;
pub mod settings;
pub mod storage;
pub mod telemetry;

pub use error::{TrackerError, TrackerResult};
