mod cascade;
/// Per-run shared context
pub mod context;
/// Single-batch execution
pub mod runner;
/// Bounded-concurrency dispatch
pub mod scheduler;
/// Batch model
pub mod types;

pub use context::*;
pub use runner::*;
pub use scheduler::*;
pub use types::*;
