//! Record-oriented data-flow runtime: a transformation job is a directed
//! graph of nodes connected by single-writer/single-reader record channels,
//! grouped into phases and executed one OS thread per node under a
//! supervising watchdog.
//!
//! Build a [`Graph`], hand it to [`WatchDog::new`] with an [`EngineConfig`],
//! and call [`WatchDog::run`]. Per-node transformation logic plugs in
//! through the [`NodeLogic`] trait; everything else — channel selection,
//! phase ordering, deadlock avoidance, abort handling — is decided by the
//! runtime.

pub mod channel;
pub mod config;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod node;
pub mod phase;
pub mod port;
pub mod record;
pub mod scheduler;

pub use channel::{Channel, ChannelKind};
pub use config::EngineConfig;
pub use errors::{ChannelError, GraphConfigError, NodeError, RunError};
pub use graph::{analyze, Graph};
pub use node::{NodeContext, NodeId, NodeLogic, NodeResult};
pub use port::{InputPort, OutputPort};
pub use record::Record;
pub use scheduler::{RunStatus, RunSummary, TrackingSink, TrackingSnapshot, WatchDog};
