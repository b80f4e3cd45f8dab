pub use crate::config::{
    ConfigData, ConfigValue, ControllerConfig, RuntimeConfig, SocketConfig, StageConfig,
    StatsConfig,
};
pub use crate::control::{ControllerInputs, Decision, Policy, ResponseTimeController, StageStats};
pub use crate::error::{HandlerFault, SinkError, SinkFailReason};
pub use crate::io::{EventSink, EventSource, FiniteQueue, MappedSink, SinkRef, TxKey};
pub use crate::model::{EventHandler, StageContext, StageEvent};
pub use crate::runtime::{ManagerHandle, StageRuntime, StageRuntimeBuilder};
pub use crate::socket::{
    ConnId, Connection, ListenerId, Readiness, SocketEvent, SocketHandle, SocketLayer,
};
pub use crate::stage::{PendingStage, Stage, StageControl};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, HealthFlag};
