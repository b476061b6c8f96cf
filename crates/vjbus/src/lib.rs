//! vjbus: coordination bus for long-running worker processes.

pub mod bridge;
pub mod config;
pub mod console;
pub mod envelope;
mod health;
pub mod logging;
pub mod node;
pub mod policy;
pub mod registry;
pub mod supervisor;
mod version;

pub use bridge::command::{
    Command, CommandError, CommandHandler, CommandReply, TransportError, handler_fn,
};
pub use bridge::topic::TopicPattern;
pub use config::{BusConfig, Capabilities, ConfigError, SupervisorConfig, WorkerSpec};
pub use console::{Console, ConsoleConfig, ConsoleError, WorkerStateReport};
pub use envelope::{
    AckPayload, Envelope, EnvelopeBuilder, EventLevel, InstanceId, MessageType, ProtocolError,
    SCHEMA_VERSION,
};
pub use health::{HealthReport, HealthStatus};
pub use node::{NodeError, NodeSender, WorkerNode};
pub use policy::{RestartDecision, RestartPolicy};
pub use registry::{Heartbeat, Registry, RegistryError, ServiceRecord, ServiceStatus};
pub use supervisor::{Supervisor, SupervisorError, SupervisorHandle, WorkerState, WorkerStatus};
pub use version::{VJBUS_VERSION, VersionInfo};
