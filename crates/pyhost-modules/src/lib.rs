//! Native modules for the pyhost bridge
//!
//! Precompiled numeric modules that the reference runtime exposes under
//! their dotted Python names:
//!
//! - [`linalg`]: `linalg.decomposition` (stateless SVD routines)
//! - [`ml`]: `ml.regression` (stateful train/predict protocol)
//!
//! Each module also has typed host wrappers that go through a
//! [`RuntimeSession`](pyhost_bridge::RuntimeSession).

pub mod linalg;
pub mod ml;
pub mod svd;

use pyhost_bridge::{BridgeConfig, ModuleContract, ReferenceRuntime, RuntimeSession};

pub use linalg::DecompositionModule;
pub use ml::{DeviceInfo, Regression, RegressionModule, TrainParams, TrainedRegression};
pub use svd::Svd;

/// Install every native module into `runtime`
pub fn register_all(runtime: &mut ReferenceRuntime) {
    runtime
        .register(DecompositionModule::new())
        .register(RegressionModule::new());
}

/// State contracts of every native module
pub fn contracts() -> Vec<ModuleContract> {
    vec![linalg::contract(), ml::contract()]
}

/// A reference runtime with every native module installed
pub fn reference_runtime() -> ReferenceRuntime {
    let mut runtime = ReferenceRuntime::new();
    register_all(&mut runtime);
    runtime
}

/// An uninitialized session over [`reference_runtime`] with contracts declared
pub fn reference_session(config: BridgeConfig) -> RuntimeSession {
    RuntimeSession::new(config, reference_runtime()).with_contracts(contracts())
}
