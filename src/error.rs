use thiserror::Error;
use uuid::Uuid;

/// Errors visible to callers of `TaskStore` operations.
///
/// Rule violations that the engine resolves by doing nothing (a cyclic
/// reparent, for instance) are not errors; they are silent no-ops.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("title is empty")]
    EmptyTitle,
    #[error("field `{0}` is managed by the engine and cannot be patched")]
    ManagedField(&'static str),
}

/// Durable store failures. Logged and absorbed by the persistence worker.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redb: {0}")]
    Redb(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("task {0} not found in backend")]
    NotFound(Uuid),
    #[error("backend lock poisoned")]
    Poisoned,
}

// redb 2.x has many error types. Blanket them all into BackendError::Redb.
macro_rules! from_redb {
    ($($t:ty),*) => {
        $(impl From<$t> for BackendError {
            fn from(e: $t) -> Self { BackendError::Redb(e.to_string()) }
        })*
    };
}

from_redb!(
    redb::Error,
    redb::DatabaseError,
    redb::TableError,
    redb::TransactionError,
    redb::StorageError,
    redb::CommitError
);

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replicated value for {id} does not decode: {reason}")]
    Decode { id: Uuid, reason: String },
    #[error("task does not encode as a field map: {0}")]
    Encode(String),
    #[error("replica lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}
