//! Error types for the supervisor

use std::io;
use thiserror::Error;

/// Supervisor error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Downloaded artifact does not match its pinned digest
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Network failure while downloading a binary, subscription or data file
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Install error: {0}")]
    Install(String),

    /// Engine could not be spawned or exited before becoming ready
    #[error("Process start failed: {0}")]
    ProcessStart(String),

    /// Engine ignored the graceful termination signal
    #[error("Process stop timed out: {0}")]
    ProcessStopTimeout(String),

    /// Engine is alive but traffic does not flow through it
    #[error("Health degraded: {0}")]
    HealthDegraded(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Error::Transport(msg.into())
    }

    pub fn install<S: Into<String>>(msg: S) -> Self {
        Error::Install(msg.into())
    }

    pub fn process_start<S: Into<String>>(msg: S) -> Self {
        Error::ProcessStart(msg.into())
    }

    pub fn process_stop_timeout<S: Into<String>>(msg: S) -> Self {
        Error::ProcessStopTimeout(msg.into())
    }

    pub fn health_degraded<S: Into<String>>(msg: S) -> Self {
        Error::HealthDegraded(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether a stale local artifact may stand in for the failed operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::integrity("digest mismatch");
        assert!(matches!(e, Error::Integrity(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::process_start("exited with status 1");
        assert_eq!(e.to_string(), "Process start failed: exited with status 1");
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(Error::transport("connection reset").is_recoverable());
        assert!(Error::timeout("30s").is_recoverable());
        assert!(!Error::integrity("bad digest").is_recoverable());
        assert!(!Error::process_start("exit 1").is_recoverable());
    }

    #[test]
    fn test_yaml_error_maps_to_parse() {
        let err = serde_yaml::from_str::<serde_yaml::Value>("a: [1, 2").unwrap_err();
        assert!(matches!(Error::from(err), Error::Parse(_)));
    }
}
