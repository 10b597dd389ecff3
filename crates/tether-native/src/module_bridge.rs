//! Loads native modules from the trusted bundle directory and exposes their
//! exports over per-module invoke channels.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, Context};
use serde_json::Value;
use tether_ipc::{IpcArgs, IpcMain};
use thiserror::Error;

use crate::channels::module_call_channel;
use crate::config::MODULE_NAMESPACE_DEFAULT;
use crate::module::{ModuleLoader, NativeModule};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("security error: invalid native module file name '{0}'")]
    InvalidFileName(String),
    #[error("native module logical name cannot be empty")]
    EmptyLogicalName,
    #[error("failed to load native module {logical_name} from {file_name}: {source:#}")]
    Load {
        file_name: String,
        logical_name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Accepts a bare file name: non-empty, no path separators, no `..`.
pub fn validate_module_file_name(file_name: &str) -> Result<(), BridgeError> {
    let valid = !file_name.is_empty()
        && !file_name.contains(['/', '\\'])
        && !file_name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidFileName(file_name.to_string()))
    }
}

type ModuleRecords = BTreeMap<String, Arc<dyn NativeModule>>;

#[derive(Clone)]
pub struct ModuleBridge {
    bundle_dir: PathBuf,
    module_namespace: String,
    loader: Arc<dyn ModuleLoader>,
    ipc: Arc<IpcMain>,
    modules: Arc<Mutex<ModuleRecords>>,
}

impl fmt::Debug for ModuleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBridge")
            .field("bundle_dir", &self.bundle_dir)
            .field("module_namespace", &self.module_namespace)
            .field("modules", &self.logical_names())
            .finish_non_exhaustive()
    }
}

impl ModuleBridge {
    pub fn new(bundle_dir: impl Into<PathBuf>, loader: Arc<dyn ModuleLoader>, ipc: Arc<IpcMain>) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            module_namespace: MODULE_NAMESPACE_DEFAULT.to_string(),
            loader,
            ipc,
            modules: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn with_module_namespace(mut self, module_namespace: impl Into<String>) -> Self {
        self.module_namespace = module_namespace.into();
        self
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    fn modules(&self) -> MutexGuard<'_, ModuleRecords> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn module(&self, logical_name: &str) -> Option<Arc<dyn NativeModule>> {
        self.modules().get(logical_name).cloned()
    }

    pub fn logical_names(&self) -> Vec<String> {
        self.modules().keys().cloned().collect()
    }

    pub fn channel_for(&self, logical_name: &str) -> String {
        module_call_channel(&self.module_namespace, logical_name)
    }

    /// Loads `file_name` from the bundle directory, records its exports under
    /// `logical_name` and (re)registers the module's call channel. Returns the
    /// channel name.
    pub async fn load_module(&self, file_name: &str, logical_name: &str) -> Result<String, BridgeError> {
        validate_module_file_name(file_name)?;
        if logical_name.trim().is_empty() {
            return Err(BridgeError::EmptyLogicalName);
        }

        let path = self.bundle_dir.join(file_name);
        let module = self.loader.load(&path).await.map_err(|source| {
            tracing::error!(
                logical_name,
                file_name,
                error = %format!("{source:#}"),
                "failed to load native module"
            );
            BridgeError::Load {
                file_name: file_name.to_string(),
                logical_name: logical_name.to_string(),
                source,
            }
        })?;

        self.modules()
            .insert(logical_name.to_string(), Arc::clone(&module));

        let channel = self.channel_for(logical_name);
        let logical = logical_name.to_string();
        let replaced = self.ipc.handle(channel.clone(), move |args: IpcArgs| {
            let module = Arc::clone(&module);
            let logical = logical.clone();
            async move { call_export(module.as_ref(), &logical, args).await }
        });
        tracing::debug!(logical_name, file_name, channel = %channel, replaced, "native module loaded");
        Ok(channel)
    }
}

async fn call_export(
    module: &dyn NativeModule,
    logical_name: &str,
    mut args: IpcArgs,
) -> anyhow::Result<Value> {
    if args.is_empty() {
        return Err(anyhow!(
            "[native] ({logical_name}): missing export name argument"
        ));
    }
    let export_name = match args.remove(0) {
        Value::String(name) => name,
        other => {
            return Err(anyhow!(
                "[native] ({logical_name}): export name must be a string, got {other}"
            ))
        }
    };
    module
        .call(&export_name, args)
        .await
        .with_context(|| format!("[native] ({logical_name}).{export_name}"))
        .inspect_err(|error| {
            tracing::error!(
                logical_name,
                export = %export_name,
                error = %format!("{error:#}"),
                "native module call failed"
            );
        })
}
