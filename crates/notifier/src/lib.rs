//! Delivery side of the relay: sink providers and the dispatcher worker pool.

pub mod dispatcher;
pub mod error;
pub mod sink;

pub use dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher, DispatcherConfig};
pub use error::SinkError;
pub use sink::{Sink, build_sink};
