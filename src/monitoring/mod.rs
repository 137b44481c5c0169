//! Optional event channel for observing engine behavior.
//!
//! When enabled, the scheduler hands out an `mpsc` sender and every
//! component reports lease, checkpoint and consumer transitions on it.
//! Delivery is best-effort; a full channel drops the event with a
//! warning rather than stall a shard task.

mod types;

pub use types::{ConsumerStateLabel, EngineEvent, EngineEventType, MonitoringConfig};
