//! Embedded interpreter backends
//!
//! [`EmbeddedRuntime`] is the foreign-function seam: everything the bridge
//! needs from an interpreter, expressed with opaque [`ObjectId`] handles
//! and owned [`PyValue`]s. Implementations are only ever driven while the
//! session's execution token is held, so they need `Send` but not `Sync`.
//!
//! - [`reference::ReferenceRuntime`]: in-memory interpreter hosting
//!   [`NativeModule`](reference::NativeModule)s written in Rust
//! - `python::PythonRuntime` (feature `python`): CPython through pyo3

use std::fmt;
use std::path::Path;

use crate::config::BundleLayout;
use crate::py_types::PyValue;

pub mod reference;

#[cfg(feature = "python")]
pub mod python;

/// Opaque handle to an interpreter-side object (module or callable).
///
/// Handles are owned by the bridge for the duration of one call and
/// released through [`EmbeddedRuntime::release`] before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

/// An exception raised inside the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFault {
    /// Exception type name (e.g., "ValueError")
    pub kind: String,
    /// Exception message
    pub message: String,
    /// Formatted traceback, when available
    pub traceback: Option<String>,
}

impl RuntimeFault {
    /// Create a fault without traceback
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// `TypeError`
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// `ValueError`
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// `RuntimeError`
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    /// `ModuleNotFoundError`
    pub fn module_not_found(module: &str) -> Self {
        Self::new("ModuleNotFoundError", format!("No module named '{}'", module))
    }

    /// `ImportError`
    pub fn import_error(message: impl Into<String>) -> Self {
        Self::new("ImportError", message)
    }

    /// `AttributeError`
    pub fn attribute_error(module: &str, name: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("module '{}' has no attribute '{}'", module, name),
        )
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why a call produced no value.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFault {
    /// The callee raised
    Raised(RuntimeFault),
    /// Arguments or the returned object could not cross the boundary
    Marshalling(String),
}

impl From<RuntimeFault> for CallFault {
    fn from(fault: RuntimeFault) -> Self {
        CallFault::Raised(fault)
    }
}

impl fmt::Display for CallFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFault::Raised(fault) => fault.fmt(f),
            CallFault::Marshalling(message) => write!(f, "marshalling: {}", message),
        }
    }
}

/// A fault reported by the interpreter's own finalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownFault {
    /// Buffered standard streams could not be flushed
    FlushFailed(String),
    /// An exit handler raised while the interpreter was tearing down
    ExitHandler(String),
    /// Any other teardown failure
    Other {
        /// Fault category
        kind: String,
        /// Fault message
        message: String,
    },
}

impl ShutdownFault {
    /// Known teardown faults that leak nothing observable.
    ///
    /// These are logged and discarded; the session still reaches
    /// `Terminated`.
    pub fn is_benign(&self) -> bool {
        !matches!(self, ShutdownFault::Other { .. })
    }

    /// Fault category name
    pub fn kind(&self) -> &str {
        match self {
            ShutdownFault::FlushFailed(_) => "FlushFailed",
            ShutdownFault::ExitHandler(_) => "ExitHandler",
            ShutdownFault::Other { kind, .. } => kind,
        }
    }

    /// Fault message
    pub fn message(&self) -> &str {
        match self {
            ShutdownFault::FlushFailed(m) | ShutdownFault::ExitHandler(m) => m,
            ShutdownFault::Other { message, .. } => message,
        }
    }
}

impl fmt::Display for ShutdownFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

/// Version tag a native extension module is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbiTag {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl AbiTag {
    /// Create a tag for `major.minor`
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for AbiTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp{}{}", self.major, self.minor)
    }
}

/// An embedded interpreter.
pub trait EmbeddedRuntime: Send {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Load the interpreter and bring it to a callable state.
    fn start(&mut self, layout: &BundleLayout) -> Result<(), RuntimeFault>;

    /// Tear the interpreter down. Called at most once, after a successful `start`.
    fn finalize(&mut self) -> Result<(), ShutdownFault>;

    /// Append a directory to the module search path.
    fn append_search_path(&mut self, path: &Path) -> Result<(), RuntimeFault>;

    /// Import a module by dotted name.
    fn import(&mut self, module: &str) -> Result<ObjectId, RuntimeFault>;

    /// Look up a callable attribute of an imported module.
    fn get_callable(&mut self, module: ObjectId, name: &str) -> Result<ObjectId, RuntimeFault>;

    /// Call a callable with positional arguments.
    ///
    /// Exceptions raised by the callee are [`CallFault::Raised`]; values
    /// that cannot be converted in either direction are
    /// [`CallFault::Marshalling`].
    fn call(&mut self, function: ObjectId, args: &[PyValue]) -> Result<PyValue, CallFault>;

    /// Drop the bridge's reference to an object.
    fn release(&mut self, object: ObjectId);

    /// Number of handles the bridge currently owns
    fn live_objects(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_fault_classification() {
        assert!(ShutdownFault::FlushFailed("stdout closed".into()).is_benign());
        assert!(ShutdownFault::ExitHandler("atexit raised".into()).is_benign());

        let other = ShutdownFault::Other {
            kind: "SegmentationFault".into(),
            message: "interpreter state corrupted".into(),
        };
        assert!(!other.is_benign());
        assert_eq!(other.to_string(), "SegmentationFault: interpreter state corrupted");
    }

    #[test]
    fn test_abi_tag_display() {
        assert_eq!(AbiTag::new(3, 12).to_string(), "cp312");
    }

    #[test]
    fn test_call_fault_from_runtime_fault() {
        let fault: CallFault = RuntimeFault::value_error("bad").into();
        assert_eq!(fault, CallFault::Raised(RuntimeFault::value_error("bad")));
        assert_eq!(CallFault::Marshalling("dict key 1".into()).to_string(), "marshalling: dict key 1");
    }

    #[test]
    fn test_runtime_fault_display() {
        let fault = RuntimeFault::module_not_found("numpy");
        assert_eq!(fault.to_string(), "ModuleNotFoundError: No module named 'numpy'");
    }
}
