//! Module resolution against the embedded runtime.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::runtime::{EmbeddedRuntime, ObjectId};

/// Tracks which search paths have been appended to a runtime and turns
/// interpreter import faults into [`BridgeError::Import`].
#[derive(Debug, Default)]
pub struct ModuleResolver {
    search_paths: IndexSet<PathBuf>,
}

impl ModuleResolver {
    /// Create a resolver with no appended paths
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths appended so far, in order
    pub fn search_paths(&self) -> impl Iterator<Item = &Path> {
        self.search_paths.iter().map(PathBuf::as_path)
    }

    /// Append `path` to the runtime's search path unless already present.
    pub fn augment(&mut self, runtime: &mut dyn EmbeddedRuntime, path: &Path) -> BridgeResult<()> {
        if self.search_paths.contains(path) {
            return Ok(());
        }
        runtime
            .append_search_path(path)
            .map_err(|fault| BridgeError::import(path.display().to_string(), fault.to_string()))?;
        debug!(path = %path.display(), "search path appended");
        self.search_paths.insert(path.to_path_buf());
        Ok(())
    }

    /// Import `module`.
    pub fn resolve(&self, runtime: &mut dyn EmbeddedRuntime, module: &str) -> BridgeResult<ObjectId> {
        validate_module_name(module)?;
        let id = runtime
            .import(module)
            .map_err(|fault| BridgeError::import(module, fault.to_string()))?;
        debug!(module, "module imported");
        Ok(id)
    }

    /// Look up `function` in an imported module.
    pub fn function(
        &self,
        runtime: &mut dyn EmbeddedRuntime,
        module_id: ObjectId,
        module: &str,
        function: &str,
    ) -> BridgeResult<ObjectId> {
        runtime
            .get_callable(module_id, function)
            .map_err(|fault| BridgeError::import(format!("{}.{}", module, function), fault.to_string()))
    }
}

/// Check that `module` is a dotted sequence of identifiers.
pub fn validate_module_name(module: &str) -> BridgeResult<()> {
    let valid = !module.is_empty()
        && module.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
                && chars.all(|c| c == '_' || c.is_alphanumeric())
        });
    if valid {
        Ok(())
    } else {
        Err(BridgeError::import(module, "invalid module name"))
    }
}
