//! Error types for the Stratus harness
//!
//! Errors are structured with fields to aid debugging against a live lab.
//! Each variant carries the context a failure report needs: the host, the
//! command that ran, the condition that timed out, the last observed value.

use std::time::Duration;

use thiserror::Error;

/// Harness Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// SSH transport or protocol failure
    #[error("ssh error [{host}]: {message}")]
    Ssh {
        /// Host the client was talking to
        host: String,
        /// Description of what failed
        message: String,
    },

    /// SSH connect retries exhausted
    #[error("ssh retry timeout [{host}]: no connection after {waited:?}")]
    SshRetryTimeout {
        /// Host we could not reach
        host: String,
        /// Total time spent retrying
        waited: Duration,
    },

    /// A remote command exited non-zero when the caller required success
    #[error("command failed (exit {exit_code}): {command}\n{output}")]
    CommandFailed {
        /// The full command line that was sent
        command: String,
        /// Remote exit code
        exit_code: i32,
        /// Combined stdout/stderr captured from the channel
        output: String,
    },

    /// Waiting for the remote prompt or an expect pattern timed out
    #[error("expect timeout [{host}]: no match for {pattern} within {waited:?}")]
    ExpectTimeout {
        /// Host the client was talking to
        host: String,
        /// Pattern(s) that never matched
        pattern: String,
        /// How long we waited
        waited: Duration,
    },

    /// CLI table output did not match the expected grammar
    #[error("invalid table structure: {message}")]
    InvalidTableStructure {
        /// What was malformed (missing separator, ragged row, ...)
        message: String,
    },

    /// A lookup into parsed output found nothing
    #[error("no match for {what}")]
    NoMatch {
        /// What was being looked up (column, key, row filter)
        what: String,
    },

    /// A poll/wait deadline expired
    #[error("timed out after {waited:?} waiting for {condition}; last value: {last}")]
    WaitTimeout {
        /// Human description of the awaited condition
        condition: String,
        /// Total time waited
        waited: Duration,
        /// Display form of the last observed value
        last: String,
    },

    /// A host operation (lock, unlock, swact, reboot) failed
    #[error("host operation '{operation}' failed on {host}: {message}")]
    HostOp {
        /// Target hostname
        host: String,
        /// Operation name
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A resource operation (delete, create) failed during cleanup or setup
    #[error("{kind} operation failed for '{id}': {message}")]
    ResourceOp {
        /// Resource kind (vm, volume, network, ...)
        kind: String,
        /// Resource identifier
        id: String,
        /// Description of what failed
        message: String,
    },

    /// A platform service rejected or mangled a request
    #[error("service error [{service}]: {message}")]
    Service {
        /// Service name (sysinv, keystone, dcmanager, kubernetes, ...)
        service: String,
        /// Description of what failed
        message: String,
    },

    /// Test asset config could not be loaded or is missing required fields
    #[error("asset config error [{path}]: {message}")]
    Asset {
        /// Path of the offending asset file
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Harness configuration error (unknown lab, bad settings key, ...)
    #[error("config error: {0}")]
    Config(String),

    /// Improper use of the harness itself (fixture phase misuse, bad scope)
    #[error("framework misuse: {0}")]
    Misuse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Create an SSH error with host context
    pub fn ssh(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Ssh {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a table-structure error
    pub fn table(msg: impl Into<String>) -> Self {
        Error::InvalidTableStructure {
            message: msg.into(),
        }
    }

    /// Create a no-match error
    pub fn no_match(what: impl Into<String>) -> Self {
        Error::NoMatch { what: what.into() }
    }

    /// Create a host-operation error
    pub fn host_op(
        host: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Error::HostOp {
            host: host.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a resource-operation error
    pub fn resource(
        kind: impl Into<String>,
        id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Error::ResourceOp {
            kind: kind.into(),
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a service error
    pub fn service(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Service {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create an asset error with path context
    pub fn asset(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Asset {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Transport and wait errors are retryable; structural errors
    /// (bad table, bad config, framework misuse) require a fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Ssh { .. } => true,
            Error::SshRetryTimeout { .. } => true,
            Error::CommandFailed { .. } => false,
            Error::ExpectTimeout { .. } => true,
            Error::InvalidTableStructure { .. } => false,
            Error::NoMatch { .. } => false,
            Error::WaitTimeout { .. } => true,
            Error::HostOp { .. } => true,
            Error::ResourceOp { .. } => true,
            Error::Service { .. } => true,
            Error::Asset { .. } => false,
            Error::Config(_) => false,
            Error::Misuse(_) => false,
            Error::Io(_) => true,
            Error::Json(_) => false,
            Error::Yaml(_) => false,
            Error::Regex(_) => false,
        }
    }

    /// Get the host name if this error is associated with a specific host
    pub fn host(&self) -> Option<&str> {
        match self {
            Error::Ssh { host, .. } => Some(host),
            Error::SshRetryTimeout { host, .. } => Some(host),
            Error::ExpectTimeout { host, .. } => Some(host),
            Error::HostOp { host, .. } => Some(host),
            _ => None,
        }
    }
}

/// A precondition gate asked for the test to be skipped.
///
/// Deliberately not an [`Error`] variant: a skip is an expected outcome of a
/// gate, and must never be conflated with a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    /// Why the gate declined to run the test
    pub reason: String,
}

impl Skip {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped: {}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a rejected CLI command surfaces the command and its output
    ///
    /// When `system host-lock` is rejected, the failure report must show
    /// what was run and what the platform said, without any re-querying.
    #[test]
    fn story_command_failure_carries_command_and_output() {
        let err = Error::CommandFailed {
            command: "system host-lock compute-0".to_string(),
            exit_code: 1,
            output: "Avoiding lock action on host".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("exit 1"));
        assert!(text.contains("system host-lock compute-0"));
        assert!(text.contains("Avoiding lock action"));
        assert!(!err.is_retryable());
    }

    /// Story: wait timeouts report the last observed value
    #[test]
    fn story_wait_timeout_reports_last_value() {
        let err = Error::WaitTimeout {
            condition: "compute-0 availability=available".to_string(),
            waited: Duration::from_secs(120),
            last: "degraded".to_string(),
        };
        assert!(err.to_string().contains("degraded"));
        assert!(err.to_string().contains("compute-0 availability=available"));
        assert!(err.is_retryable());
    }

    #[test]
    fn host_accessor_returns_host_for_ssh_errors() {
        assert_eq!(Error::ssh("controller-0", "eof").host(), Some("controller-0"));
        assert_eq!(
            Error::SshRetryTimeout {
                host: "compute-1".to_string(),
                waited: Duration::from_secs(60),
            }
            .host(),
            Some("compute-1")
        );
        assert_eq!(Error::table("no separator").host(), None);
    }

    #[test]
    fn structural_errors_are_not_retryable() {
        assert!(!Error::table("ragged row").is_retryable());
        assert!(!Error::no_match("column 'uuid'").is_retryable());
        assert!(!Error::Config("unknown lab".to_string()).is_retryable());
        assert!(Error::host_op("compute-0", "unlock", "in progress").is_retryable());
    }

    #[test]
    fn skip_is_not_an_error() {
        let skip = Skip::new("requires at least two hypervisors");
        assert_eq!(skip.to_string(), "skipped: requires at least two hypervisors");
    }
}
