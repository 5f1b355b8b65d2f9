//! Relay server: listener, per-session handling and the byte splice

mod buffer_pool;
mod listener;
pub mod metrics;
mod relay;
mod session;

pub use buffer_pool::{BufferPool, BufferPoolConfig, PooledBuffer, RELAY_BUFFER_SIZE};
pub use listener::Relay;
pub use metrics::{ActiveSessionGuard, MetricsSnapshot, RelayMetrics, ACTIVE_CONN_COUNT, TOTAL_CONN_COUNT};
pub use relay::{Direction, Splice, SpliceOutcome};
