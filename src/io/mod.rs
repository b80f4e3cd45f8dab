pub mod base;
pub mod queue;

pub use base::*;
pub use queue::FiniteQueue;
