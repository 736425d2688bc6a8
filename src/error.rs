//! Error kinds (§7), following the teacher's split of a top-level aggregate
//! error over one `thiserror` enum per subsystem, plus an `ErrorLevel` trait
//! consulted at the log site instead of blanket `error!`ing everything.

use std::error::Error as StdError;

use thiserror::Error;

use crate::scope_registry::ScopeId;

/// Defines the log severity an error should be reported at.
pub trait ErrorLevel: StdError {
    /// The level to log this error at.
    fn level(&self) -> tracing::Level {
        tracing::Level::ERROR
    }
}

/// Errors from the scope tree / plain-task spawning layer (§9 "Coroutine
/// control flow").
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("scope {0} aborted")]
    AbortedScope(ScopeId),
    #[error("task exited with error: {0}")]
    TaskError(Box<dyn StdError + Send + Sync>),
    #[error("scope launch failed: {0}")]
    ScopeLaunchError(Box<dyn StdError + Send + Sync>),
}

impl ErrorLevel for RuntimeError {
    fn level(&self) -> tracing::Level {
        tracing::Level::WARN
    }
}

/// Transport-layer errors: framing, (de)serialization, and raw I/O over a
/// channel (§6 "Transport").
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode wire message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode wire message: {0}")]
    Decode(serde_json::Error),
    #[error("peer closed the channel before completing the handshake")]
    HandshakeFailed,
    #[error("peer sent an unexpected message before handshaking")]
    UnexpectedMessage,
}

impl ErrorLevel for TransportError {
    fn level(&self) -> tracing::Level {
        tracing::Level::WARN
    }
}

/// Portal-side errors (§4.2, §7).
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("channel closed")]
    ChannelClosed,
    #[error("remote function raised {kind}: {message}")]
    RemoteError { kind: String, message: String, traceback: String },
    #[error("no pending result to await")]
    NoPendingResult,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ErrorLevel for PortalError {
    fn level(&self) -> tracing::Level {
        match self {
            PortalError::RemoteError { .. } | PortalError::ChannelClosed => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

/// Nursery-side errors (§4.3, §7).
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum NurseryError {
    #[error("failed to spawn actor process {name}: {source}")]
    SpawnFailure { name: String, source: std::io::Error },
    #[error("timed out waiting for {0}")]
    TimeoutExceeded(String),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ErrorLevel for NurseryError {
    fn level(&self) -> tracing::Level {
        tracing::Level::WARN
    }
}

/// Arbiter registry errors (§4.5, §7).
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no actor registered under the name {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ErrorLevel for RegistryError {
    fn level(&self) -> tracing::Level {
        tracing::Level::INFO
    }
}

/// Pub/sub fan-out errors (§4.4, §7).
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("producer generator failed: {0}")]
    ProducerFailed(String),
    #[error("task slot {0:?} is not declared for this publisher")]
    UnknownSlot(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ErrorLevel for PubSubError {
    fn level(&self) -> tracing::Level {
        tracing::Level::WARN
    }
}

/// Configuration errors (§4.8).
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to parse config file: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

impl ErrorLevel for ConfigError {}

/// The crate-wide aggregate error, mirroring the teacher's `RuntimeError`
/// split but rooted one level higher to cover every subsystem this runtime
/// adds on top of the teacher's scope tree.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum BrooderError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Nursery(#[from] NurseryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Scope was cancelled; never treated as an error during nursery
    /// teardown (§7 "Cancelled").
    #[error("cancelled")]
    Cancelled,
}

impl ErrorLevel for BrooderError {
    fn level(&self) -> tracing::Level {
        match self {
            BrooderError::Cancelled => tracing::Level::DEBUG,
            BrooderError::Runtime(e) => e.level(),
            BrooderError::Transport(e) => e.level(),
            BrooderError::Portal(e) => e.level(),
            BrooderError::Nursery(e) => e.level(),
            BrooderError::Registry(e) => e.level(),
            BrooderError::PubSub(e) => e.level(),
            BrooderError::Config(e) => e.level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_nested_transport_error_keeps_its_own_level_through_every_wrapper() {
        let transport = TransportError::HandshakeFailed;
        let portal = PortalError::Transport(TransportError::HandshakeFailed);
        let brooder = BrooderError::from(PortalError::Transport(TransportError::HandshakeFailed));

        assert_eq!(transport.level(), tracing::Level::WARN);
        assert_eq!(portal.level(), tracing::Level::ERROR);
        assert_eq!(brooder.level(), tracing::Level::ERROR);
    }

    #[test]
    fn cancellation_logs_quietly_regardless_of_which_subsystem_it_came_from() {
        assert_eq!(BrooderError::Cancelled.level(), tracing::Level::DEBUG);
    }

    #[test]
    fn a_remote_error_and_a_closed_channel_both_log_as_a_warning() {
        assert_eq!(PortalError::ChannelClosed.level(), tracing::Level::WARN);
        let remote = PortalError::RemoteError {
            kind: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            traceback: String::new(),
        };
        assert_eq!(remote.level(), tracing::Level::WARN);
    }

    #[test]
    fn config_errors_fall_back_to_the_default_error_level() {
        let err = ConfigError::FileRead(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        assert_eq!(err.level(), tracing::Level::ERROR);
    }
}
