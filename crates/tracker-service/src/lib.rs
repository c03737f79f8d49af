pub mod dispatch;
pub mod queue;
pub mod service;
pub mod sink;
pub mod snapshot;
pub mod source;

/// Version stamped into every record and into the snapshot marker name.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
