//! # Error Handling
//!
//! Error types for the bridge, grouped by the phase in which they occur.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR TAXONOMY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Fatal at init (process exits with a distinct code)                     │
//! │  ├── InitError        10-16  config, app service, logging, state store, │
//! │  │                           users, portals, puppets                    │
//! │  └── GenerateError    20-22  registration generation                    │
//! │                                                                         │
//! │  Isolated at runtime (logged, scoped to one user/puppet/portal)         │
//! │  ├── SessionError     remote-network connect / disconnect               │
//! │  ├── MatrixError      homeserver calls                                  │
//! │  └── RegistryError    key conflicts, unknown entities                   │
//! │                                                                         │
//! │  Best effort at shutdown (logged, never changes the exit code)          │
//! │  └── BridgeError      wraps the above per shutdown step                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::supervisor::BridgeState;

/// Failure to read, parse, validate or write the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of the persistence backend or the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed data in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Loaded records contradict each other (e.g. two users claim one JID).
    #[error("inconsistent records: {0}")]
    Inconsistent(String),
}

/// Registry lookups and index mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no entry for key {0}")]
    NotFound(String),

    #[error("key {0} is already present")]
    DuplicateKey(String),

    /// The secondary key is bound to a different entity.
    #[error("{key} is already bound to {owner}")]
    SecondaryKeyTaken { key: String, owner: String },
}

/// Remote-network session failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Homeserver client-server API failures.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("homeserver returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token belongs to {actual}, expected {expected}")]
    UserMismatch { expected: String, actual: String },
}

/// Fatal initialization failures. Each kind has its own exit code so that
/// operators can tell them apart without reading logs.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Failed to load config: {0}")]
    Config(#[source] ConfigError),

    #[error("Failed to initialize AppService: {0}")]
    AppService(#[source] ConfigError),

    #[error("Failed to open log file: {0}")]
    Logging(String),

    #[error("Failed to load state store: {0}")]
    StateStore(#[source] StoreError),

    #[error("Failed to load users: {0}")]
    Users(#[source] StoreError),

    #[error("Failed to load portals: {0}")]
    Portals(#[source] StoreError),

    #[error("Failed to load puppets: {0}")]
    Puppets(#[source] StoreError),
}

impl InitError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::Config(_) => 10,
            InitError::AppService(_) => 11,
            InitError::Logging(_) => 12,
            InitError::StateStore(_) => 13,
            InitError::Users(_) => 14,
            InitError::Portals(_) => 15,
            InitError::Puppets(_) => 16,
        }
    }
}

/// Fatal failures of `--generate-registration`.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Failed to generate registration: {0}")]
    Generate(#[source] ConfigError),

    #[error("Failed to save registration: {0}")]
    SaveRegistration(#[source] ConfigError),

    #[error("Failed to save config: {0}")]
    SaveConfig(#[source] ConfigError),
}

impl GenerateError {
    pub fn exit_code(&self) -> i32 {
        match self {
            GenerateError::Generate(_) => 20,
            GenerateError::SaveRegistration(_) => 21,
            GenerateError::SaveConfig(_) => 22,
        }
    }
}

/// Runtime and shutdown failures of the supervisor.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: BridgeState, to: BridgeState },

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("application service failed: {0}")]
    Serve(std::io::Error),

    #[error("{task} task panicked or was cancelled")]
    TaskJoin { task: &'static str },

    #[error("{failed} of {total} sessions failed to disconnect")]
    Disconnect { failed: usize, total: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}
