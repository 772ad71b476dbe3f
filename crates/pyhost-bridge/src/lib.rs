//! Python Interop Bridge
//!
//! Calls numeric routines written for an embedded Python runtime from a
//! Rust host, either in-process or in an isolated subprocess.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Rust Host                               │
//! │  ┌──────────────┐     ┌──────────────┐     ┌──────────────┐     │
//! │  │    Value     │ ←→  │ Marshalling  │ ←→  │   PyValue    │     │
//! │  └──────────────┘     └──────────────┘     └──────────────┘     │
//! │         ↓                                          ↓            │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │     RuntimeSession (execution token, lifecycle)          │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │         ↓                                          ↓            │
//! │  ┌──────────────────────┐           ┌────────────────────────┐  │
//! │  │  EmbeddedRuntime     │           │   SubprocessBridge     │  │
//! │  │  (reference, pyo3)   │           │  (argv/stdin → JSON)   │  │
//! │  └──────────────────────┘           └────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`session`]: session object, execution token, in-process invocation
//! - [`lifecycle`]: `Uninitialized → Initialized → Terminated`
//! - [`resolver`]: search-path augmentation and module resolution
//! - [`conversion`]: `ToPython` / `FromPython` and JSON encoding
//! - [`subprocess`]: isolated-process transport
//! - [`state`]: stateless / stateful module contracts
//! - [`runtime`]: interpreter backends
//!
//! # Feature Flags
//!
//! - `python`: embed CPython through pyo3

pub mod config;
pub mod conversion;
pub mod error;
pub mod gil;
pub mod invoke;
pub mod lifecycle;
pub mod py_types;
pub mod resolver;
pub mod runtime;
pub mod session;
pub mod state;
pub mod subprocess;
pub mod value;

pub use config::{BridgeConfig, BundleLayout};
pub use conversion::{FromPython, PyDictBuilder, ToPython};
pub use error::{BridgeError, BridgeResult};
pub use gil::{gil_stats, GilStats};
pub use invoke::{InvocationRequest, InvocationResult};
pub use lifecycle::LifecycleState;
pub use py_types::PyValue;
pub use runtime::reference::{CallArgs, NativeModule, ReferenceRuntime};
pub use runtime::{AbiTag, CallFault, EmbeddedRuntime, RuntimeFault, ShutdownFault};
pub use session::{RuntimeSession, SessionLock};
pub use state::{ContractRegistry, ModuleContract, StateClass};
pub use subprocess::{ExternalInvocation, ProcessOutput, SubprocessBridge};
pub use value::{Mapping, Matrix, Value};

#[cfg(feature = "python")]
pub use runtime::python::PythonRuntime;
