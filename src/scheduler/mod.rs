//! Phase scheduling and run supervision.

mod message;
mod tracking;
mod watchdog;

pub use tracking::{LogTrackingSink, NodeSnapshot, TrackingSink, TrackingSnapshot};
pub use watchdog::{PhaseSummary, RunStatus, RunSummary, WatchDog};
