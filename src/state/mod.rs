//! Durable and in-memory run state: the checkpoint envelope, the
//! circuit breaker, and the progress counters.

pub mod breaker;
pub mod checkpoint;
pub mod pool;

pub use breaker::CircuitBreaker;
pub use checkpoint::{CheckpointStore, ExecutionState};
pub use pool::ExecutionPool;
