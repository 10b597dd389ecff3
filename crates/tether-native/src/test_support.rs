use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::module::{FnModule, NativeModule};
use crate::require_shim::{ModuleSource, RequireShim, ScriptEvaluator};

/// Line-oriented toy language:
/// `require <id>` adds a `dep:<id>` export listing the dependency's exports,
/// `export <name> <json>` adds a constant export, `throw <message>` fails.
pub(crate) struct LineEvaluator;

impl ScriptEvaluator for LineEvaluator {
    fn evaluate(
        &self,
        code: &str,
        _origin: &str,
        require: &mut RequireShim,
    ) -> Result<Arc<dyn NativeModule>> {
        let mut module = FnModule::new();
        for line in code.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if let Some(id) = line.strip_prefix("require ") {
                let dependency = require.require(id)?;
                let exports = json!(dependency.exports());
                module = module.with_sync_export(format!("dep:{id}"), move |_| Ok(exports.clone()));
            } else if let Some(rest) = line.strip_prefix("export ") {
                let (name, raw) = rest
                    .split_once(' ')
                    .with_context(|| format!("malformed export line '{line}'"))?;
                let value: Value = serde_json::from_str(raw)
                    .with_context(|| format!("malformed export value '{raw}'"))?;
                module = module.with_sync_export(name, move |_| Ok(value.clone()));
            } else if let Some(message) = line.strip_prefix("throw ") {
                bail!("{message}");
            } else {
                bail!("unknown statement '{line}'");
            }
        }
        Ok(Arc::new(module))
    }
}

/// In-memory module source that records every path it was asked for.
pub(crate) struct MapModuleSource {
    files: BTreeMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl MapModuleSource {
    pub(crate) fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, code)| (path.to_string(), code.to_string()))
                .collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("requested lock").clone()
    }
}

impl ModuleSource for MapModuleSource {
    fn read_module(&self, path: &str) -> Result<Option<String>> {
        self.requested
            .lock()
            .expect("requested lock")
            .push(path.to_string());
        Ok(self.files.get(path).cloned())
    }
}
