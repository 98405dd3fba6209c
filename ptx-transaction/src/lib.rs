//! Transaction bookkeeping: per-partition states, dependency tracking, and lock admission.

pub mod dependency;
pub mod latch;
pub mod pool;
pub mod queue;
pub mod state;
