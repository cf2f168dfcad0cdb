// 客户端往返延迟测量

pub mod monitor;

pub use monitor::{LatencyStats, LatencyTracker, PING_RING_SIZE};
