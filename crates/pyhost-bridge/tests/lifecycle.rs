//! Session lifecycle tests

use std::fs;

use pretty_assertions::assert_eq;
use pyhost_bridge::{
    BridgeConfig, BridgeError, LifecycleState, ReferenceRuntime, RuntimeFault, RuntimeSession,
    ShutdownFault,
};
use tempfile::TempDir;

fn bundle() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("Lib").join("site-packages")).unwrap();
    fs::write(dir.path().join("python312.zip"), b"stub").unwrap();
    dir
}

fn session_for(dir: &TempDir, runtime: ReferenceRuntime) -> RuntimeSession {
    let config = BridgeConfig::new(dir.path()).with_environment(false);
    RuntimeSession::new(config, runtime)
}

#[test]
fn test_shutdown_before_initialize_is_noop() {
    let dir = bundle();
    let session = session_for(&dir, ReferenceRuntime::new());
    session.shutdown().unwrap();
    assert_eq!(session.state(), LifecycleState::Uninitialized);

    // The session is still usable afterwards
    session.initialize().unwrap();
    assert_eq!(session.state(), LifecycleState::Initialized);
}

#[test]
fn test_initialize_and_shutdown_are_idempotent() {
    let dir = bundle();
    let session = session_for(&dir, ReferenceRuntime::new());

    session.initialize().unwrap();
    session.initialize().unwrap();
    assert_eq!(session.state(), LifecycleState::Initialized);

    session.shutdown().unwrap();
    session.shutdown().unwrap();
    assert_eq!(session.state(), LifecycleState::Terminated);
}

#[test]
fn test_missing_bundle_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::new(dir.path().join("absent")).with_environment(false);
    let session = RuntimeSession::new(config, ReferenceRuntime::new());

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, BridgeError::Initialization { .. }));
    assert!(err.is_fatal());
    assert_eq!(session.state(), LifecycleState::Uninitialized);
}

#[test]
fn test_empty_bundle_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_for(&dir, ReferenceRuntime::new());

    let err = session.initialize().unwrap_err();
    assert!(err.to_string().contains("empty"));
    assert_eq!(session.state(), LifecycleState::Uninitialized);

    // Populating the bundle lets a retry succeed
    fs::write(dir.path().join("python312.zip"), b"stub").unwrap();
    session.initialize().unwrap();
    assert_eq!(session.state(), LifecycleState::Initialized);
}

#[test]
fn test_runtime_start_failure_leaves_uninitialized() {
    let dir = bundle();
    let runtime = ReferenceRuntime::new()
        .fail_start_with(RuntimeFault::new("Fatal Python error", "init_fs_encoding"));
    let session = session_for(&dir, runtime);

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, BridgeError::Initialization { .. }));
    assert_eq!(session.state(), LifecycleState::Uninitialized);
}

#[test]
fn test_initialize_after_shutdown_is_refused() {
    let dir = bundle();
    let session = session_for(&dir, ReferenceRuntime::new());
    session.initialize().unwrap();
    session.shutdown().unwrap();

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState { .. }));
    assert_eq!(session.state(), LifecycleState::Terminated);
}

#[test]
fn test_benign_shutdown_fault_is_swallowed() {
    let dir = bundle();
    let runtime = ReferenceRuntime::new()
        .fail_finalize_with(ShutdownFault::FlushFailed("sys.stdout closed".into()));
    let session = session_for(&dir, runtime);
    session.initialize().unwrap();

    session.shutdown().unwrap();
    assert_eq!(session.state(), LifecycleState::Terminated);
}

#[test]
fn test_other_shutdown_fault_is_reported() {
    let dir = bundle();
    let runtime = ReferenceRuntime::new().fail_finalize_with(ShutdownFault::Other {
        kind: "Fatal".into(),
        message: "PyThreadState_Get: no current thread".into(),
    });
    let session = session_for(&dir, runtime);
    session.initialize().unwrap();

    let err = session.shutdown().unwrap_err();
    match err {
        BridgeError::Shutdown { kind, message } => {
            assert_eq!(kind, "Fatal");
            assert!(message.contains("no current thread"));
        }
        other => panic!("expected shutdown error, got {:?}", other),
    }
    assert_eq!(session.state(), LifecycleState::Terminated);

    // A second shutdown has nothing left to do
    session.shutdown().unwrap();
}

#[test]
fn test_environment_bindings() {
    let dir = bundle();
    let config = BridgeConfig::new(dir.path());
    let session = RuntimeSession::new(config, ReferenceRuntime::new());
    session.initialize().unwrap();

    assert_eq!(
        std::env::var_os("PYTHONHOME").map(std::path::PathBuf::from),
        Some(dir.path().to_path_buf())
    );
    let var = pyhost_bridge::lifecycle::library_path_var();
    let paths: Vec<_> = std::env::split_paths(&std::env::var_os(var).unwrap()).collect();
    assert_eq!(paths[0], dir.path());
}
