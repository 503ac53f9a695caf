//! 后台 Worker：溢出队列消费

pub mod drainer;

pub use drainer::{backoff_delay, DrainStats, QueueDrainer};
