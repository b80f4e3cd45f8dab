pub use cancel_token::*;
pub use health_flag::*;

mod cancel_token;
pub mod config_io;
mod health_flag;
pub mod logger;
