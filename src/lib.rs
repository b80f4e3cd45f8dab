pub mod config;
pub mod control;
pub mod error;
pub mod io;
pub mod model;
pub mod runtime;
pub mod socket;
pub mod stage;
mod test;
pub mod utils;

pub mod prelude;

#[doc(hidden)]
pub use tracing;
