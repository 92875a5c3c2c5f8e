//! Task hierarchy engine: a working cache whose mutations obey the
//! parent/child and status rules, persisted to a runtime-selected backend
//! and mirrored into a replicated map shared with other clients.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod local;
pub mod model;
pub mod remote;
pub mod replica;
pub mod selector;
pub mod server;
pub mod session;
pub mod store;

pub use backend::{BackendKind, MemoryBackend, TaskBackend};
pub use config::{Config, ServerConfig};
pub use error::{BackendError, ConfigError, EngineError, ReplicaError};
pub use model::{
    AppSettings, Category, Difficulty, PriorityUpdate, Task, TaskPatch, TimerInterval, TriageStatus, UserSettings,
};
pub use session::Session;
pub use store::{ChangeSource, TaskStore, TasksChanged};
