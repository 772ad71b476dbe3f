//! Error Types for the Python Bridge
//!
//! Every failure the bridge can surface to its caller is a [`BridgeError`].
//!
//! ## Error Categories
//!
//! - Initialization failures (bundle missing or empty)
//! - Import failures (module absent, ABI mismatch)
//! - Python exceptions raised during a call
//! - Marshalling failures (type or shape mismatch)
//! - Subprocess failures (non-zero exit, spawn, timeout)
//!
//! Benign teardown faults never become a `BridgeError`; see
//! [`ShutdownFault`](crate::runtime::ShutdownFault).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// The runtime bundle could not be used to start the interpreter
    #[error("failed to initialize runtime from {}: {reason}", .bundle.display())]
    Initialization {
        /// Bundle root that was checked
        bundle: PathBuf,
        /// Reason for failure
        reason: String,
    },

    /// A module could not be imported or a function could not be found in it
    #[error("cannot import '{module}': {cause}")]
    Import {
        /// Dotted module name (or `module.function` for attribute lookups)
        module: String,
        /// Underlying cause reported by the runtime
        cause: String,
    },

    /// A Python exception escaped the called function
    #[error("{module}.{function} raised {exception_type}: {message}")]
    Invocation {
        /// Module containing the function
        module: String,
        /// Function that raised
        function: String,
        /// Python exception type (e.g., "ValueError")
        exception_type: String,
        /// Exception message
        message: String,
        /// Formatted traceback, when the runtime provides one
        traceback: Option<String>,
    },

    /// A value could not be converted across the boundary
    #[error("marshalling failed: {reason}")]
    Marshalling {
        /// Description of the mismatch
        reason: String,
    },

    /// A subprocess exited with a non-zero code
    #[error("subprocess exited with code {exit_code}: {stderr}")]
    Subprocess {
        /// Process exit code (-1 when terminated by a signal)
        exit_code: i32,
        /// Captured standard error, trailing whitespace trimmed
        stderr: String,
    },

    /// A subprocess could not be started
    #[error("failed to spawn {}: {reason}", .executable.display())]
    Spawn {
        /// Executable that failed to start
        executable: PathBuf,
        /// OS error description
        reason: String,
    },

    /// A subprocess exceeded its timeout and was killed.
    ///
    /// Its pipe threads are joined within a short grace period. Threads
    /// blocked on pipes that the child's own descendants keep open are
    /// detached and end when those pipes close.
    #[error("subprocess killed after {elapsed:?}")]
    Timeout {
        /// Time waited before the process was killed
        elapsed: Duration,
    },

    /// I/O failure while talking to a subprocess
    #[error("I/O error during {context}: {message}")]
    Io {
        /// What the bridge was doing
        context: String,
        /// Error message
        message: String,
    },

    /// Operation not allowed in the current lifecycle or module state
    #[error("invalid state: {context}")]
    InvalidState {
        /// Description of the violated precondition
        context: String,
    },

    /// The current thread already holds the execution token
    #[error("execution token is already held by this thread")]
    TokenReentry,

    /// The execution token could not be acquired in time
    #[error("execution token unavailable after {waited:?}")]
    TokenUnavailable {
        /// Time spent waiting
        waited: Duration,
    },

    /// A non-benign fault during runtime teardown
    #[error("runtime shutdown failed: {kind}: {message}")]
    Shutdown {
        /// Fault category
        kind: String,
        /// Fault message
        message: String,
    },

    /// A stateful-module handle was used after the module state moved on
    #[error("stale handle for '{module}': handle is generation {held}, module is at {current}")]
    StaleHandle {
        /// Stateful module name
        module: String,
        /// Generation recorded in the handle
        held: i64,
        /// Generation reported by the module
        current: i64,
    },

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Create an initialization error
    pub fn initialization(bundle: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BridgeError::Initialization {
            bundle: bundle.into(),
            reason: reason.into(),
        }
    }

    /// Create an import error
    pub fn import(module: impl Into<String>, cause: impl Into<String>) -> Self {
        BridgeError::Import {
            module: module.into(),
            cause: cause.into(),
        }
    }

    /// Create a marshalling error from a free-form reason
    pub fn marshalling(reason: impl Into<String>) -> Self {
        BridgeError::Marshalling {
            reason: reason.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::marshalling(format!("expected {}, got {}", expected, actual))
    }

    /// Create a missing field error
    pub fn missing_field(field: &str) -> Self {
        Self::marshalling(format!("result has no field '{}'", field))
    }

    /// Create a numeric overflow error
    pub fn numeric_overflow(value: impl fmt::Display, target_type: &str) -> Self {
        Self::marshalling(format!("{} cannot be represented as {}", value, target_type))
    }

    /// Create an invalid state error
    pub fn invalid_state(context: impl Into<String>) -> Self {
        BridgeError::InvalidState {
            context: context.into(),
        }
    }

    /// Create an I/O error
    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        BridgeError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Check if this is a marshalling error
    pub fn is_marshalling(&self) -> bool {
        matches!(self, BridgeError::Marshalling { .. })
    }

    /// Check if this is a Python exception
    pub fn is_python_exception(&self) -> bool {
        matches!(self, BridgeError::Invocation { .. })
    }

    /// Check if the error makes the session or module unusable.
    ///
    /// Invocation and marshalling errors are per-call; the host keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Initialization { .. }
                | BridgeError::Import { .. }
                | BridgeError::Shutdown { .. }
        )
    }
}
