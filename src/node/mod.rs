//! # Node Module
//!
//! Connections to external audio nodes.
//!
//! ### [`connection`] - Node Connection
//! - One WebSocket per node, opened with `Authorization`, `Num-Shards` and
//!   `User-Id` headers
//! - Reconnects forever with capped quantized backoff (see [`retry_interval`])
//! - Surfaces `Ready`, `Disconnect`, `Message` and `Error` through a sink
//!   registered at creation
//!
//! ### [`address`] - Node Address
//! - `host[:port][@region]` parsing for configuration
//!
//! ### [`stats`] - Load Statistics
//! - Latest `op: stats` sample per node, used for least-loaded placement

pub mod address;
pub mod connection;
pub mod stats;

pub use address::NodeAddress;
pub use connection::{
    retry_interval, NodeConnection, NodeEvent, NodeEventKind, NodeEventSink, NodeOptions,
    NodeState, NodeStatus, DEFAULT_PORT,
};
pub use stats::{CpuStats, MemoryStats, NodeStats};
