pub mod controller;
pub mod inputs;
pub mod policy;
pub mod stats;

pub use controller::ResponseTimeController;
pub use inputs::{ControllerInputs, Decision};
pub use policy::Policy;
pub use stats::{LatencySampler, StageStats, StatsSnapshot};
