//! Bridge configuration and runtime bundle layout.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Environment variable overriding [`BridgeConfig::bundle_root`]
pub const BUNDLE_ENV: &str = "PYHOST_BUNDLE";

/// Environment variable overriding [`BridgeConfig::subprocess_timeout_ms`]
pub const TIMEOUT_ENV: &str = "PYHOST_SUBPROCESS_TIMEOUT_MS";

/// Configuration for a runtime session and its subprocess transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root of the self-contained runtime distribution
    pub bundle_root: PathBuf,

    /// Package search directory, relative to the bundle root
    pub package_dir: PathBuf,

    /// Additional module search paths appended after the package directory
    pub extra_search_paths: Vec<PathBuf>,

    /// Export runtime-home and library-path variables before start-up
    pub apply_environment: bool,

    /// Interpreter used in subprocess mode (defaults to the bundled one)
    pub interpreter: Option<PathBuf>,

    /// Kill subprocesses that run longer than this (no limit when unset)
    pub subprocess_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bundle_root: PathBuf::from("python"),
            package_dir: PathBuf::from("Lib").join("site-packages"),
            extra_search_paths: Vec::new(),
            apply_environment: true,
            interpreter: None,
            subprocess_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration rooted at `bundle_root`
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> BridgeResult<Self> {
        toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Apply `PYHOST_BUNDLE` and `PYHOST_SUBPROCESS_TIMEOUT_MS` if set
    pub fn with_env_overrides(mut self) -> BridgeResult<Self> {
        if let Some(root) = std::env::var_os(BUNDLE_ENV) {
            self.bundle_root = PathBuf::from(root);
        }
        if let Ok(ms) = std::env::var(TIMEOUT_ENV) {
            let ms = ms
                .trim()
                .parse::<u64>()
                .map_err(|e| BridgeError::Config(format!("{}={}: {}", TIMEOUT_ENV, ms, e)))?;
            self.subprocess_timeout_ms = Some(ms);
        }
        Ok(self)
    }

    /// Set the package directory (relative to the bundle root)
    pub fn with_package_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.package_dir = dir.into();
        self
    }

    /// Append an extra module search path
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_search_paths.push(path.into());
        self
    }

    /// Enable or disable environment bindings
    pub fn with_environment(mut self, apply: bool) -> Self {
        self.apply_environment = apply;
        self
    }

    /// Set the subprocess timeout
    pub fn with_subprocess_timeout(mut self, timeout: Duration) -> Self {
        self.subprocess_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Subprocess timeout as a duration
    pub fn subprocess_timeout(&self) -> Option<Duration> {
        self.subprocess_timeout_ms.map(Duration::from_millis)
    }

    /// Derive the bundle layout
    pub fn layout(&self) -> BundleLayout {
        BundleLayout::new(&self.bundle_root, &self.package_dir, self.interpreter.as_deref())
    }

    /// All search paths in the order they are appended to the runtime
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let layout = self.layout();
        std::iter::once(layout.package_dir)
            .chain(self.extra_search_paths.iter().cloned())
            .collect()
    }
}

/// Paths derived from a runtime bundle root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    /// Bundle root
    pub root: PathBuf,
    /// Runtime home (`PYTHONHOME`)
    pub home: PathBuf,
    /// Package search directory
    pub package_dir: PathBuf,
    /// Directory holding the interpreter shared library
    pub library_dir: PathBuf,
    /// Interpreter executable for subprocess mode
    pub interpreter: PathBuf,
}

impl BundleLayout {
    fn new(root: &Path, package_dir: &Path, interpreter: Option<&Path>) -> Self {
        let interpreter = interpreter
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.join(default_interpreter_name()));
        Self {
            root: root.to_path_buf(),
            home: root.to_path_buf(),
            package_dir: root.join(package_dir),
            library_dir: root.to_path_buf(),
            interpreter,
        }
    }
}

fn default_interpreter_name() -> &'static str {
    if cfg!(windows) {
        "python.exe"
    } else {
        "python"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.apply_environment);
        assert_eq!(config.subprocess_timeout(), None);
        assert_eq!(config.package_dir, Path::new("Lib").join("site-packages"));
    }

    #[test]
    fn test_from_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
bundle_root = "/opt/bundle"
package_dir = "site-packages"
extra_search_paths = ["/srv/models"]
subprocess_timeout_ms = 1500
"#,
        )
        .unwrap();

        assert_eq!(config.bundle_root, PathBuf::from("/opt/bundle"));
        assert_eq!(config.subprocess_timeout(), Some(Duration::from_millis(1500)));
        assert!(config.apply_environment);
        assert_eq!(
            config.search_paths(),
            vec![
                PathBuf::from("/opt/bundle/site-packages"),
                PathBuf::from("/srv/models")
            ]
        );
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = BridgeConfig::from_toml_str("bundle_root = [").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::load(Path::new("/nonexistent/pyhost.toml")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_layout() {
        let layout = BridgeConfig::new("/opt/bundle").layout();
        assert_eq!(layout.home, PathBuf::from("/opt/bundle"));
        assert_eq!(
            layout.package_dir,
            PathBuf::from("/opt/bundle").join("Lib").join("site-packages")
        );
        assert_eq!(layout.interpreter, PathBuf::from("/opt/bundle").join(default_interpreter_name()));
    }
}
