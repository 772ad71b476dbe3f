//! Runtime lifecycle: bundle verification, environment bindings and the
//! `Uninitialized -> Initialized -> Terminated` state machine.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::BundleLayout;
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::EmbeddedRuntime;

/// Runtime session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No interpreter has been started
    Uninitialized,
    /// The interpreter is running and callable
    Initialized,
    /// The interpreter was shut down; terminal
    Terminated,
}

impl LifecycleState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Uninitialized => 0,
            LifecycleState::Initialized => 1,
            LifecycleState::Terminated => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initialized,
            _ => LifecycleState::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Check that the bundle root exists, is a directory, and is non-empty.
pub fn verify_bundle(root: &Path) -> BridgeResult<()> {
    if !root.exists() {
        return Err(BridgeError::initialization(root, "bundle directory does not exist"));
    }
    if !root.is_dir() {
        return Err(BridgeError::initialization(root, "bundle path is not a directory"));
    }
    let mut entries = fs::read_dir(root)
        .map_err(|e| BridgeError::initialization(root, format!("cannot read bundle: {}", e)))?;
    if entries.next().is_none() {
        return Err(BridgeError::initialization(root, "bundle directory is empty"));
    }
    Ok(())
}

/// Name of the variable the platform's loader searches for shared libraries
pub fn library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Export the runtime home and prepend the bundle's library directory to
/// the loader path. Applying twice does not duplicate the entry.
pub fn apply_environment(layout: &BundleLayout) -> BridgeResult<()> {
    env::set_var("PYTHONHOME", &layout.home);

    let var = library_path_var();
    let current = env::var_os(var).unwrap_or_default();
    if let Some(updated) = prepend_path(&current, &layout.library_dir)? {
        env::set_var(var, updated);
    }
    debug!(home = %layout.home.display(), var, "runtime environment applied");
    Ok(())
}

fn prepend_path(current: &OsString, dir: &Path) -> BridgeResult<Option<OsString>> {
    let mut paths: Vec<PathBuf> = env::split_paths(current).collect();
    if paths.iter().any(|p| p == dir) {
        return Ok(None);
    }
    paths.insert(0, dir.to_path_buf());
    env::join_paths(paths)
        .map(Some)
        .map_err(|e| BridgeError::initialization(dir, format!("invalid library path: {}", e)))
}

/// Drive `runtime` from `state` to `Initialized`.
///
/// Idempotent when already initialized. On failure the state is left
/// `Uninitialized` so the caller may fix the bundle and retry.
pub(crate) fn initialize(
    state: &mut LifecycleState,
    runtime: &mut dyn EmbeddedRuntime,
    layout: &BundleLayout,
    apply_env: bool,
) -> BridgeResult<()> {
    match *state {
        LifecycleState::Initialized => return Ok(()),
        LifecycleState::Terminated => {
            return Err(BridgeError::invalid_state(
                "runtime was terminated and cannot be restarted",
            ))
        }
        LifecycleState::Uninitialized => {}
    }

    verify_bundle(&layout.root)?;
    if apply_env {
        apply_environment(layout)?;
    }
    runtime
        .start(layout)
        .map_err(|fault| BridgeError::initialization(&layout.root, fault.to_string()))?;

    *state = LifecycleState::Initialized;
    info!(runtime = runtime.name(), bundle = %layout.root.display(), "runtime initialized");
    Ok(())
}

/// Drive `runtime` to `Terminated`.
///
/// A no-op when never initialized or already terminated. Benign teardown
/// faults are logged and swallowed; anything else is reported, but the
/// state is `Terminated` either way.
pub(crate) fn shutdown(
    state: &mut LifecycleState,
    runtime: &mut dyn EmbeddedRuntime,
) -> BridgeResult<()> {
    if *state != LifecycleState::Initialized {
        debug!(%state, "shutdown ignored");
        return Ok(());
    }

    let result = runtime.finalize();
    *state = LifecycleState::Terminated;

    match result {
        Ok(()) => {
            info!(runtime = runtime.name(), "runtime terminated");
            Ok(())
        }
        Err(fault) if fault.is_benign() => {
            warn!(kind = fault.kind(), message = fault.message(), "ignoring benign shutdown fault");
            Ok(())
        }
        Err(fault) => Err(BridgeError::Shutdown {
            kind: fault.kind().to_string(),
            message: fault.message().to_string(),
        }),
    }
}
