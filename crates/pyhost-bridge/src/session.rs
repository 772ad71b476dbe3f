//! Runtime Session
//!
//! A [`RuntimeSession`] owns one embedded interpreter, the execution token
//! guarding it, the set of appended search paths and the declared module
//! contracts. All interpreter work happens through the session.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pyhost_bridge::{BridgeConfig, InvocationRequest, RuntimeSession};
//! use pyhost_bridge::runtime::reference::ReferenceRuntime;
//!
//! let session = RuntimeSession::new(BridgeConfig::new("python"), ReferenceRuntime::new());
//! session.initialize()?;
//! let result = session.invoke(&InvocationRequest::new("linalg.decomposition", "svd_dict").arg(m))?;
//! session.shutdown()?;
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

use crate::config::{BridgeConfig, BundleLayout};
use crate::error::{BridgeError, BridgeResult};
use crate::gil::{Gil, GilGuard};
use crate::invoke::{dispatch, InvocationRequest, InvocationResult};
use crate::lifecycle::{self, LifecycleState};
use crate::resolver::ModuleResolver;
use crate::runtime::EmbeddedRuntime;
use crate::state::{ContractRegistry, ModuleContract};
use crate::value::{Mapping, Value};

/// Interpreter state reachable only while the token is held
pub(crate) struct SessionState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) runtime: Box<dyn EmbeddedRuntime>,
    pub(crate) resolver: ModuleResolver,
}

/// An embedded interpreter and everything needed to call into it.
///
/// The execution token belongs to the session, not the process. The
/// reference backend allows any number of sessions per process, each with
/// its own token; `PythonRuntime` refuses to start a second interpreter.
pub struct RuntimeSession {
    config: BridgeConfig,
    layout: BundleLayout,
    search_paths: Vec<PathBuf>,
    contracts: ContractRegistry,
    state: AtomicU8,
    gil: Gil<SessionState>,
}

impl RuntimeSession {
    /// Create an uninitialized session around `runtime`
    pub fn new(config: BridgeConfig, runtime: impl EmbeddedRuntime + 'static) -> Self {
        Self::from_boxed(config, Box::new(runtime))
    }

    /// Create an uninitialized session around a boxed runtime
    pub fn from_boxed(config: BridgeConfig, runtime: Box<dyn EmbeddedRuntime>) -> Self {
        let layout = config.layout();
        let search_paths = config.search_paths();
        Self {
            config,
            layout,
            search_paths,
            contracts: ContractRegistry::new(),
            state: AtomicU8::new(LifecycleState::Uninitialized.as_u8()),
            gil: Gil::new(SessionState {
                lifecycle: LifecycleState::Uninitialized,
                runtime,
                resolver: ModuleResolver::new(),
            }),
        }
    }

    /// Declare module contracts
    pub fn with_contracts(self, contracts: impl IntoIterator<Item = ModuleContract>) -> Self {
        for contract in contracts {
            self.contracts.declare(contract);
        }
        self
    }

    /// Session configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bundle layout derived from the configuration
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Declared module contracts
    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    /// Contract declared for `module`
    pub fn contract(&self, module: &str) -> Option<ModuleContract> {
        self.contracts.get(module)
    }

    /// Current lifecycle state. Does not take the token.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start the interpreter. Idempotent; fails after shutdown.
    pub fn initialize(&self) -> BridgeResult<()> {
        let mut guard = self.gil.acquire()?;
        let SessionState {
            lifecycle, runtime, ..
        } = &mut *guard;
        let result = lifecycle::initialize(
            lifecycle,
            runtime.as_mut(),
            &self.layout,
            self.config.apply_environment,
        );
        self.state.store(lifecycle.as_u8(), Ordering::Release);
        result
    }

    /// Stop the interpreter. Idempotent; a no-op before `initialize`.
    pub fn shutdown(&self) -> BridgeResult<()> {
        let mut guard = self.gil.acquire()?;
        let SessionState {
            lifecycle, runtime, ..
        } = &mut *guard;
        let result = lifecycle::shutdown(lifecycle, runtime.as_mut());
        self.state.store(lifecycle.as_u8(), Ordering::Release);
        result
    }

    /// Take the execution token for a sequence of calls.
    pub fn lock(&self) -> BridgeResult<SessionLock<'_>> {
        Ok(SessionLock {
            session: self,
            guard: self.gil.acquire()?,
        })
    }

    /// Take the execution token, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> BridgeResult<SessionLock<'_>> {
        Ok(SessionLock {
            session: self,
            guard: self.gil.try_acquire_for(timeout)?,
        })
    }

    /// Check if the current thread holds this session's token
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.gil.is_held_by_current_thread()
    }

    /// Invoke a function returning a mapping.
    pub fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        self.lock()?.invoke(request)
    }

    /// Invoke a function returning any value shape.
    pub fn invoke_value(&self, request: &InvocationRequest) -> BridgeResult<Value> {
        self.lock()?.invoke_value(request)
    }

    /// Shorthand for [`invoke`](Self::invoke)
    pub fn call(&self, module: &str, function: &str, args: Vec<Value>) -> InvocationResult {
        self.invoke(&InvocationRequest::new(module, function).args(args))
    }
}

impl fmt::Debug for RuntimeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeSession")
            .field("bundle", &self.layout.root)
            .field("state", &self.state())
            .field("gil", &self.gil)
            .finish()
    }
}

impl Drop for RuntimeSession {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Initialized {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "runtime shutdown failed while dropping session");
        }
    }
}

/// Execution token held by the caller across several calls.
///
/// Released when dropped.
pub struct SessionLock<'a> {
    session: &'a RuntimeSession,
    guard: GilGuard<'a, SessionState>,
}

impl SessionLock<'_> {
    /// Invoke a function returning a mapping
    pub fn invoke(&mut self, request: &InvocationRequest) -> InvocationResult {
        self.invoke_value(request)?.into_mapping()
    }

    /// Invoke a function returning any value shape
    pub fn invoke_value(&mut self, request: &InvocationRequest) -> BridgeResult<Value> {
        dispatch(&mut self.guard, &self.session.search_paths, request)
    }

    /// Shorthand for [`invoke`](Self::invoke)
    pub fn call(&mut self, module: &str, function: &str, args: Vec<Value>) -> BridgeResult<Mapping> {
        self.invoke(&InvocationRequest::new(module, function).args(args))
    }

    /// Number of interpreter objects the bridge currently owns
    pub fn live_objects(&self) -> usize {
        self.guard.runtime.live_objects()
    }

    /// Search paths appended so far
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.guard.resolver.search_paths().map(PathBuf::from).collect()
    }
}

static GLOBAL: OnceLock<RuntimeSession> = OnceLock::new();

/// Install the process-wide session.
///
/// Fails if one was already installed.
pub fn install(session: RuntimeSession) -> BridgeResult<&'static RuntimeSession> {
    let already = || BridgeError::invalid_state("a process-wide runtime session is already installed");
    GLOBAL.set(session).map_err(|_| already())?;
    GLOBAL.get().ok_or_else(already)
}

/// The process-wide session, if installed
pub fn global() -> Option<&'static RuntimeSession> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::reference::ReferenceRuntime;
    use std::fs;

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Lib").join("site-packages")).unwrap();
        dir
    }

    #[test]
    fn test_state_mirror() {
        let dir = bundle();
        let config = BridgeConfig::new(dir.path()).with_environment(false);
        let session = RuntimeSession::new(config, ReferenceRuntime::new());
        assert_eq!(session.state(), LifecycleState::Uninitialized);
        session.initialize().unwrap();
        assert_eq!(session.state(), LifecycleState::Initialized);
        session.shutdown().unwrap();
        assert_eq!(session.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_invoke_before_initialize() {
        let session = RuntimeSession::new(BridgeConfig::new("/missing"), ReferenceRuntime::new());
        let err = session.call("linalg.decomposition", "svd_dict", vec![]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { .. }));
    }

    #[test]
    fn test_reference_sessions_hold_independent_tokens() {
        let dir = bundle();
        let config = BridgeConfig::new(dir.path()).with_environment(false);
        let first = RuntimeSession::new(config.clone(), ReferenceRuntime::new());
        let second = RuntimeSession::new(config, ReferenceRuntime::new());
        first.initialize().unwrap();
        second.initialize().unwrap();

        let _held = first.lock().unwrap();
        assert!(first.is_locked_by_current_thread());
        assert!(!second.is_locked_by_current_thread());
        let other = second.lock().unwrap();
        assert_eq!(other.live_objects(), 0);
    }

    #[test]
    fn test_lock_reentry() {
        let session = RuntimeSession::new(BridgeConfig::new("/missing"), ReferenceRuntime::new());
        let _lock = session.lock().unwrap();
        assert!(session.is_locked_by_current_thread());
        assert!(matches!(session.initialize(), Err(BridgeError::TokenReentry)));
    }

    #[test]
    fn test_install_once() {
        let first = RuntimeSession::new(BridgeConfig::new("/a"), ReferenceRuntime::new());
        let second = RuntimeSession::new(BridgeConfig::new("/b"), ReferenceRuntime::new());
        let installed = install(first).unwrap();
        assert!(install(second).is_err());
        assert!(std::ptr::eq(installed, global().unwrap()));
    }
}
