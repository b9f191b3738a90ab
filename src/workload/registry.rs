//! Workload registry.
//!
//! A job's `environment.script` names its workload. Names resolve either to
//! in-process workloads registered in code or to command workloads loaded
//! from `*.toml` files.

use super::{CommandSpec, CommandWorkload, Workload};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkloadFile {
    workload: CommandSpec,
}

type Factory = Box<dyn Fn() -> Box<dyn Workload> + Send + Sync>;

/// Named workload factories.
#[derive(Default)]
pub struct WorkloadRegistry {
    factories: HashMap<String, Factory>,
}

impl WorkloadRegistry {
    /// Create an empty registry with no workloads.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register an in-process workload. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<F, W>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: Workload + 'static,
    {
        let factory: Factory = Box::new(move || Box::new(factory()) as Box<dyn Workload>);
        self.factories.insert(name.to_string(), factory);
    }

    pub fn register_command(&mut self, spec: CommandSpec) {
        let name = spec.name.clone();
        self.register(&name, move || CommandWorkload::new(spec.clone()));
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read workload dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: WorkloadFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad workload config {}: {e}", path.display()))
                })?;
                debug!(name = %file.workload.name, path = %path.display(), "loaded workload");
                registry.register_command(file.workload);
            }
        }

        Ok(registry)
    }

    /// Instantiate the workload registered under `name`.
    pub fn create(&self, name: &str) -> Option<Box<dyn Workload>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
