//! In-memory reference interpreter
//!
//! Hosts [`NativeModule`]s implemented in Rust behind the same
//! [`EmbeddedRuntime`] seam as CPython. Modules behave like precompiled
//! extensions living under the package search directory: they can only be
//! imported once a search path has been appended, and only when their ABI
//! tag matches the interpreter's.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::{debug, warn};

use super::{AbiTag, CallFault, EmbeddedRuntime, ObjectId, RuntimeFault, ShutdownFault};
use crate::config::BundleLayout;
use crate::conversion::FromPython;
use crate::py_types::PyValue;

/// ABI tag of the reference interpreter
pub const REFERENCE_ABI: AbiTag = AbiTag::new(3, 12);

/// A module implemented in Rust and exposed to the interpreter.
///
/// Stateful modules keep their state in `self`; the interpreter hands
/// out `&mut self` only while the execution token is held.
pub trait NativeModule: Send {
    /// Dotted module name
    fn name(&self) -> &str;

    /// ABI the module was built for
    fn abi(&self) -> AbiTag {
        REFERENCE_ABI
    }

    /// Callable attribute names
    fn functions(&self) -> &[&'static str];

    /// Call one of [`functions`](Self::functions) with positional arguments
    fn call(&mut self, function: &str, args: &[PyValue]) -> Result<PyValue, RuntimeFault>;
}

#[derive(Debug, Clone)]
enum Handle {
    Module(SmolStr),
    Function { module: SmolStr, name: SmolStr },
}

/// The in-memory interpreter.
pub struct ReferenceRuntime {
    abi: AbiTag,
    modules: IndexMap<SmolStr, Box<dyn NativeModule>>,
    search_path: Vec<PathBuf>,
    handles: HashMap<ObjectId, Handle>,
    next_id: u64,
    started: bool,
    start_fault: Option<RuntimeFault>,
    shutdown_fault: Option<ShutdownFault>,
}

impl ReferenceRuntime {
    /// Create an interpreter with no modules
    pub fn new() -> Self {
        Self::with_abi(REFERENCE_ABI)
    }

    /// Create an interpreter reporting a specific ABI tag
    pub fn with_abi(abi: AbiTag) -> Self {
        Self {
            abi,
            modules: IndexMap::new(),
            search_path: Vec::new(),
            handles: HashMap::new(),
            next_id: 1,
            started: false,
            start_fault: None,
            shutdown_fault: None,
        }
    }

    /// Register a native module
    pub fn register(&mut self, module: impl NativeModule + 'static) -> &mut Self {
        self.modules
            .insert(SmolStr::new(module.name()), Box::new(module));
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_module(mut self, module: impl NativeModule + 'static) -> Self {
        self.register(module);
        self
    }

    /// Make the next `start` fail with `fault`
    pub fn fail_start_with(mut self, fault: RuntimeFault) -> Self {
        self.start_fault = Some(fault);
        self
    }

    /// Make `finalize` report `fault`
    pub fn fail_finalize_with(mut self, fault: ShutdownFault) -> Self {
        self.shutdown_fault = Some(fault);
        self
    }

    /// Current module search path
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Names of registered modules
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(SmolStr::as_str)
    }

    fn ensure_started(&self) -> Result<(), RuntimeFault> {
        if self.started {
            Ok(())
        } else {
            Err(RuntimeFault::runtime_error("interpreter is not running"))
        }
    }

    fn allocate(&mut self, handle: Handle) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.handles.insert(id, handle);
        id
    }
}

impl Default for ReferenceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedRuntime for ReferenceRuntime {
    fn name(&self) -> &str {
        "reference"
    }

    fn start(&mut self, layout: &BundleLayout) -> Result<(), RuntimeFault> {
        if let Some(fault) = self.start_fault.take() {
            return Err(fault);
        }
        debug!(home = %layout.home.display(), abi = %self.abi, "reference interpreter started");
        self.started = true;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ShutdownFault> {
        self.started = false;
        self.handles.clear();
        match self.shutdown_fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn append_search_path(&mut self, path: &Path) -> Result<(), RuntimeFault> {
        self.ensure_started()?;
        self.search_path.push(path.to_path_buf());
        Ok(())
    }

    fn import(&mut self, module: &str) -> Result<ObjectId, RuntimeFault> {
        self.ensure_started()?;
        let native = match self.modules.get(module) {
            Some(native) if !self.search_path.is_empty() => native,
            _ => return Err(RuntimeFault::module_not_found(module)),
        };
        if native.abi() != self.abi {
            return Err(RuntimeFault::import_error(format!(
                "module '{}' was compiled for {}, interpreter is {}",
                module,
                native.abi(),
                self.abi
            )));
        }
        Ok(self.allocate(Handle::Module(SmolStr::new(module))))
    }

    fn get_callable(&mut self, module: ObjectId, name: &str) -> Result<ObjectId, RuntimeFault> {
        self.ensure_started()?;
        let module_name = match self.handles.get(&module) {
            Some(Handle::Module(m)) => m.clone(),
            _ => return Err(RuntimeFault::type_error("handle does not refer to a module")),
        };
        let exists = self
            .modules
            .get(&module_name)
            .map_or(false, |m| m.functions().iter().any(|f| *f == name));
        if !exists {
            return Err(RuntimeFault::attribute_error(&module_name, name));
        }
        Ok(self.allocate(Handle::Function {
            module: module_name,
            name: SmolStr::new(name),
        }))
    }

    fn call(&mut self, function: ObjectId, args: &[PyValue]) -> Result<PyValue, CallFault> {
        self.ensure_started()?;
        let (module, name) = match self.handles.get(&function) {
            Some(Handle::Function { module, name }) => (module.clone(), name.clone()),
            _ => return Err(RuntimeFault::type_error("object is not callable").into()),
        };
        let native = self
            .modules
            .get_mut(&module)
            .ok_or_else(|| RuntimeFault::module_not_found(&module))?;
        match panic::catch_unwind(AssertUnwindSafe(|| native.call(&name, args))) {
            Ok(result) => result.map_err(CallFault::Raised),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%module, function = %name, %message, "native module panicked");
                Err(CallFault::Raised(RuntimeFault::new("PanicException", message)))
            }
        }
    }

    fn release(&mut self, object: ObjectId) {
        self.handles.remove(&object);
    }

    fn live_objects(&self) -> usize {
        self.handles.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native module panicked".to_string()
    }
}

/// Positional argument reader for native module functions.
///
/// Conversion failures become `TypeError` faults naming the parameter.
#[derive(Debug, Clone, Copy)]
pub struct CallArgs<'a> {
    function: &'a str,
    args: &'a [PyValue],
}

impl<'a> CallArgs<'a> {
    /// Wrap the arguments of a call to `function`
    pub fn new(function: &'a str, args: &'a [PyValue]) -> Self {
        Self { function, args }
    }

    /// Fail if more than `max` arguments were passed
    pub fn at_most(self, max: usize) -> Result<Self, RuntimeFault> {
        if self.args.len() > max {
            return Err(RuntimeFault::type_error(format!(
                "{}() takes at most {} positional arguments but {} were given",
                self.function,
                max,
                self.args.len()
            )));
        }
        Ok(self)
    }

    /// Required argument at `index`
    pub fn required<T: FromPython>(&self, index: usize, name: &str) -> Result<T, RuntimeFault> {
        let value = self.args.get(index).ok_or_else(|| {
            RuntimeFault::type_error(format!(
                "{}() missing required argument: '{}'",
                self.function, name
            ))
        })?;
        self.convert(value, name)
    }

    /// Optional argument at `index`; missing or `None` yields `default`
    pub fn optional<T: FromPython>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, RuntimeFault> {
        match self.args.get(index) {
            None | Some(PyValue::None) => Ok(default),
            Some(value) => self.convert(value, name),
        }
    }

    /// Raw argument at `index`
    pub fn raw(&self, index: usize) -> Option<&'a PyValue> {
        self.args.get(index)
    }

    fn convert<T: FromPython>(&self, value: &PyValue, name: &str) -> Result<T, RuntimeFault> {
        T::from_python(value).map_err(|e| {
            RuntimeFault::type_error(format!("{}() argument '{}': {}", self.function, name, e))
        })
    }
}
