//! Inbound sensor stream.

pub mod consumer;
pub mod types;

pub use consumer::{ConsumerTask, StreamConsumer};
pub use types::{parse_line, SensorReading, StreamError};
