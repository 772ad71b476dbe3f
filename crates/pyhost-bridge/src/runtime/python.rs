//! CPython backend through pyo3
//!
//! The interpreter is linked at build time; `start` points it at the
//! bundle (the environment bindings must already be applied) and
//! initializes it. CPython cannot be re-initialized after finalization,
//! so a process gets exactly one `PythonRuntime` start.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};
use smol_str::SmolStr;
use tracing::{debug, info};

use super::{CallFault, EmbeddedRuntime, ObjectId, RuntimeFault, ShutdownFault};
use crate::config::BundleLayout;
use crate::py_types::PyValue;

/// Set once the process has started CPython
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Embedded CPython.
#[derive(Default)]
pub struct PythonRuntime {
    objects: HashMap<ObjectId, Py<PyAny>>,
    next_id: u64,
    started: bool,
}

impl PythonRuntime {
    /// Create an unstarted runtime
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&mut self, object: Py<PyAny>) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(id, object);
        id
    }

    fn lookup(&self, id: ObjectId) -> Result<&Py<PyAny>, RuntimeFault> {
        self.objects
            .get(&id)
            .ok_or_else(|| RuntimeFault::runtime_error(format!("unknown object handle {}", id.0)))
    }
}

impl EmbeddedRuntime for PythonRuntime {
    fn name(&self) -> &str {
        "cpython"
    }

    fn start(&mut self, layout: &BundleLayout) -> Result<(), RuntimeFault> {
        if CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(RuntimeFault::runtime_error(
                "CPython was already started in this process",
            ));
        }
        Python::initialize();
        let version = Python::attach(|py| py.version().to_string());
        info!(home = %layout.home.display(), %version, "CPython initialized");
        self.started = true;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ShutdownFault> {
        if !self.started {
            return Ok(());
        }
        Python::attach(|_py| self.objects.clear());
        self.started = false;

        // Finalization consumes the thread state, so the GIL is taken through
        // the raw API and never released.
        let status = unsafe {
            pyo3::ffi::PyGILState_Ensure();
            pyo3::ffi::Py_FinalizeEx()
        };
        if status < 0 {
            return Err(ShutdownFault::FlushFailed(format!(
                "Py_FinalizeEx returned {}",
                status
            )));
        }
        debug!("CPython finalized");
        Ok(())
    }

    fn append_search_path(&mut self, path: &Path) -> Result<(), RuntimeFault> {
        Python::attach(|py| {
            let sys = py.import("sys")?;
            sys.getattr("path")?
                .call_method1("append", (path.to_string_lossy().as_ref(),))?;
            Ok::<_, PyErr>(())
        })
        .map_err(fault_from_err)
    }

    fn import(&mut self, module: &str) -> Result<ObjectId, RuntimeFault> {
        let object = Python::attach(|py| {
            py.import(module)
                .map(|m| m.into_any().unbind())
                .map_err(|e| fault_from(py, &e))
        })?;
        Ok(self.store(object))
    }

    fn get_callable(&mut self, module: ObjectId, name: &str) -> Result<ObjectId, RuntimeFault> {
        let module = self.lookup(module)?;
        let object = Python::attach(|py| {
            let bound = module.bind(py);
            let attr = bound.getattr(name).map_err(|e| fault_from(py, &e))?;
            if !attr.is_callable() {
                return Err(RuntimeFault::type_error(format!(
                    "'{}' object is not callable",
                    type_name(&attr)
                )));
            }
            Ok(attr.unbind())
        })?;
        Ok(self.store(object))
    }

    fn call(&mut self, function: ObjectId, args: &[PyValue]) -> Result<PyValue, CallFault> {
        let function = self.lookup(function)?;
        Python::attach(|py| {
            let items = args
                .iter()
                .map(|a| to_object(py, a))
                .collect::<PyResult<Vec<_>>>()
                .map_err(|e| marshalling(py, &e))?;
            let tuple = PyTuple::new(py, items).map_err(|e| marshalling(py, &e))?;
            let result = function
                .bind(py)
                .call1(tuple)
                .map_err(|e| CallFault::Raised(fault_from(py, &e)))?;
            from_object(&result)
        })
    }

    fn release(&mut self, object: ObjectId) {
        if let Some(object) = self.objects.remove(&object) {
            Python::attach(|_py| drop(object));
        }
    }

    fn live_objects(&self) -> usize {
        self.objects.len()
    }
}

fn to_object<'py>(py: Python<'py>, value: &PyValue) -> PyResult<Bound<'py, PyAny>> {
    Ok(match value {
        PyValue::None => py.None().into_bound(py),
        PyValue::Bool(b) => b.into_pyobject(py)?.to_owned().into_any(),
        PyValue::Int(n) => n.into_pyobject(py)?.into_any(),
        PyValue::Float(f) => f.into_pyobject(py)?.into_any(),
        PyValue::Str(s) => s.as_str().into_pyobject(py)?.into_any(),
        PyValue::List(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(to_object(py, item)?)?;
            }
            list.into_any()
        }
        PyValue::Tuple(items) => {
            let items = items
                .iter()
                .map(|v| to_object(py, v))
                .collect::<PyResult<Vec<_>>>()?;
            PyTuple::new(py, items)?.into_any()
        }
        PyValue::Dict(map) => {
            let dict = PyDict::new(py);
            for (k, v) in map {
                dict.set_item(k.as_str(), to_object(py, v)?)?;
            }
            dict.into_any()
        }
    })
}

fn from_object(obj: &Bound<'_, PyAny>) -> Result<PyValue, CallFault> {
    let py = obj.py();
    let err = |e: PyErr| marshalling(py, &e);

    if obj.is_none() {
        Ok(PyValue::None)
    } else if let Ok(b) = obj.cast::<PyBool>() {
        Ok(PyValue::Bool(b.is_true()))
    } else if let Ok(i) = obj.cast::<PyInt>() {
        Ok(PyValue::Int(i.extract().map_err(err)?))
    } else if let Ok(f) = obj.cast::<PyFloat>() {
        Ok(PyValue::Float(f.value()))
    } else if let Ok(s) = obj.cast::<PyString>() {
        Ok(PyValue::Str(SmolStr::new(s.to_str().map_err(err)?)))
    } else if let Ok(list) = obj.cast::<PyList>() {
        list.iter()
            .map(|item| from_object(&item))
            .collect::<Result<_, _>>()
            .map(PyValue::List)
    } else if let Ok(tuple) = obj.cast::<PyTuple>() {
        tuple
            .iter()
            .map(|item| from_object(&item))
            .collect::<Result<_, _>>()
            .map(PyValue::Tuple)
    } else if let Ok(dict) = obj.cast::<PyDict>() {
        let mut map = IndexMap::with_capacity(dict.len());
        for (k, v) in dict.iter() {
            let key = k.cast::<PyString>().map_err(|_| {
                CallFault::Marshalling(format!("dict keys must be str, got {}", type_name(&k)))
            })?;
            map.insert(SmolStr::new(key.to_str().map_err(err)?), from_object(&v)?);
        }
        Ok(PyValue::Dict(map))
    } else if obj.hasattr("tolist").map_err(err)? {
        // ndarray and numpy scalars
        let plain = obj
            .call_method0("tolist")
            .map_err(|e| CallFault::Raised(fault_from(py, &e)))?;
        from_object(&plain)
    } else {
        Err(CallFault::Marshalling(format!(
            "cannot return object of type '{}' across the bridge",
            type_name(obj)
        )))
    }
}

fn type_name(obj: &Bound<'_, PyAny>) -> String {
    obj.get_type()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "object".to_string())
}

fn fault_from(py: Python<'_>, err: &PyErr) -> RuntimeFault {
    let kind = err
        .get_type(py)
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let message = err
        .value(py)
        .str()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let traceback = err.traceback(py).and_then(|tb| tb.format().ok());
    RuntimeFault {
        kind,
        message,
        traceback,
    }
}

fn marshalling(py: Python<'_>, err: &PyErr) -> CallFault {
    CallFault::Marshalling(fault_from(py, err).to_string())
}

fn fault_from_err(err: PyErr) -> RuntimeFault {
    Python::attach(|py| fault_from(py, &err))
}
