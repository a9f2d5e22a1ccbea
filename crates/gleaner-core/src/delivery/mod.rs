//! Delivery - Sink への配送（Run の結果とキューのテレメトリ）

pub mod buffer;
pub mod telemetry;

pub use buffer::{DeliveryBuffer, DeliveryBufferEntry, FlushReport};
pub use telemetry::TelemetryDebouncer;
