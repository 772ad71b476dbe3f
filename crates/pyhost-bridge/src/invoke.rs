//! In-process invocation
//!
//! One call runs four phases under the execution token: search-path
//! augmentation, argument marshalling, module/function resolution and the
//! call itself followed by result marshalling. Interpreter exceptions stop
//! at this boundary and come back as [`BridgeError::Invocation`].

use std::fmt;
use std::path::PathBuf;

use smol_str::SmolStr;
use tracing::{debug, debug_span};

use crate::conversion::{marshal_args, unmarshal};
use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::LifecycleState;
use crate::py_types::PyValue;
use crate::resolver::ModuleResolver;
use crate::runtime::{CallFault, EmbeddedRuntime, ObjectId};
use crate::session::SessionState;
use crate::value::{Mapping, Value};

/// Result of an in-process call: a mapping from field name to value
pub type InvocationResult = BridgeResult<Mapping>;

/// A call into the embedded runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Dotted module name
    pub module: SmolStr,
    /// Function name inside the module
    pub function: SmolStr,
    /// Positional arguments
    pub args: Vec<Value>,
}

impl InvocationRequest {
    /// Create a request with no arguments
    pub fn new(module: impl Into<SmolStr>, function: impl Into<SmolStr>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: Vec::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append several positional arguments
    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }
}

impl fmt::Display for InvocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({} args)", self.module, self.function, self.args.len())
    }
}

/// Run `request` against session state the caller has locked.
pub(crate) fn dispatch(
    state: &mut SessionState,
    search_paths: &[PathBuf],
    request: &InvocationRequest,
) -> BridgeResult<Value> {
    if state.lifecycle != LifecycleState::Initialized {
        return Err(BridgeError::invalid_state(format!(
            "cannot invoke {}.{}: runtime is {}",
            request.module, request.function, state.lifecycle
        )));
    }

    let span = debug_span!("invoke", module = %request.module, function = %request.function);
    let _enter = span.enter();

    let SessionState {
        runtime, resolver, ..
    } = state;
    let runtime: &mut dyn EmbeddedRuntime = runtime.as_mut();

    for path in search_paths {
        resolver.augment(runtime, path)?;
    }

    let args = marshal_args(&request.args);
    let mut temps = Vec::with_capacity(2);
    let result = call(runtime, resolver, request, &args, &mut temps);
    for object in temps.into_iter().rev() {
        runtime.release(object);
    }

    match &result {
        Ok(value) => debug!(kind = value.kind(), "call returned"),
        Err(e) => debug!(error = %e, "call failed"),
    }
    result
}

fn call(
    runtime: &mut dyn EmbeddedRuntime,
    resolver: &ModuleResolver,
    request: &InvocationRequest,
    args: &[PyValue],
    temps: &mut Vec<ObjectId>,
) -> BridgeResult<Value> {
    let module = resolver.resolve(runtime, &request.module)?;
    temps.push(module);
    let function = resolver.function(runtime, module, &request.module, &request.function)?;
    temps.push(function);

    let raw = runtime.call(function, args).map_err(|fault| match fault {
        CallFault::Raised(fault) => BridgeError::Invocation {
            module: request.module.to_string(),
            function: request.function.to_string(),
            exception_type: fault.kind,
            message: fault.message,
            traceback: fault.traceback,
        },
        CallFault::Marshalling(message) => BridgeError::marshalling(format!(
            "{}.{} returned an unconvertible value: {}",
            request.module, request.function, message
        )),
    })?;
    unmarshal(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Matrix;

    #[test]
    fn test_request_builder() {
        let m = Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let request = InvocationRequest::new("linalg.decomposition", "svd_dict")
            .arg(m)
            .arg(true);
        assert_eq!(request.args.len(), 2);
        assert_eq!(request.to_string(), "linalg.decomposition.svd_dict(2 args)");
    }
}
