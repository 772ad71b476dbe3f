//! Module state contracts
//!
//! Every module is declared either stateless (calls are independent and
//! may run in any order, including concurrently in separate processes) or
//! stateful (calls depend on earlier calls and must follow a protocol).

use indexmap::IndexMap;
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};

/// How a module's functions relate to each other
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateClass {
    /// Each call is independent
    Stateless,
    /// Calls mutate module state; `protocol` lists functions in required order
    Stateful {
        /// Ordered protocol (e.g., train before predict)
        protocol: Vec<SmolStr>,
    },
}

/// Declared contract for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleContract {
    /// Dotted module name
    pub module: SmolStr,
    /// State classification
    pub state: StateClass,
    /// Exposed functions
    pub functions: Vec<SmolStr>,
}

impl ModuleContract {
    /// Stateless contract
    pub fn stateless(module: &str, functions: &[&str]) -> Self {
        Self {
            module: SmolStr::new(module),
            state: StateClass::Stateless,
            functions: functions.iter().map(|f| SmolStr::new(f)).collect(),
        }
    }

    /// Stateful contract; `protocol` is a prefix-ordered subset of `functions`
    pub fn stateful(module: &str, functions: &[&str], protocol: &[&str]) -> Self {
        Self {
            module: SmolStr::new(module),
            state: StateClass::Stateful {
                protocol: protocol.iter().map(|f| SmolStr::new(f)).collect(),
            },
            functions: functions.iter().map(|f| SmolStr::new(f)).collect(),
        }
    }

    /// Check if the module is stateful
    pub fn is_stateful(&self) -> bool {
        matches!(self.state, StateClass::Stateful { .. })
    }

    /// Position of `function` in the protocol, if it takes part in one
    pub fn position(&self, function: &str) -> Option<usize> {
        match &self.state {
            StateClass::Stateless => None,
            StateClass::Stateful { protocol } => protocol.iter().position(|f| f == function),
        }
    }
}

/// Thread-safe registry of declared contracts
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: RwLock<IndexMap<SmolStr, ModuleContract>>,
}

impl ContractRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or replace) a contract
    pub fn declare(&self, contract: ModuleContract) {
        self.contracts.write().insert(contract.module.clone(), contract);
    }

    /// Look up a contract
    pub fn get(&self, module: &str) -> Option<ModuleContract> {
        self.contracts.read().get(module).cloned()
    }

    /// Check if `module` is declared stateful
    pub fn is_stateful(&self, module: &str) -> bool {
        self.contracts
            .read()
            .get(module)
            .map_or(false, ModuleContract::is_stateful)
    }

    /// Fail unless `module` is declared stateless.
    ///
    /// Undeclared modules are refused too: parallel execution is only
    /// allowed for modules known to be independent per call.
    pub fn check_parallel_safe(&self, module: &str) -> BridgeResult<()> {
        match self.contracts.read().get(module) {
            Some(c) if !c.is_stateful() => Ok(()),
            Some(_) => Err(BridgeError::invalid_state(format!(
                "module '{}' is stateful and cannot run in parallel",
                module
            ))),
            None => Err(BridgeError::invalid_state(format!(
                "module '{}' has no declared contract",
                module
            ))),
        }
    }

    /// Number of declared contracts
    pub fn len(&self) -> usize {
        self.contracts.read().len()
    }

    /// Check if no contracts are declared
    pub fn is_empty(&self) -> bool {
        self.contracts.read().is_empty()
    }
}
