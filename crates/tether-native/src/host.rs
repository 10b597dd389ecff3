use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tether_ipc::{IpcArgs, IpcMain, RendererSink};

use crate::channels::{load_native_channel, read_module_channel, register_native_channel};
use crate::config::HostConfig;
use crate::module::{ModuleLoader, NativeModule};
use crate::module_bridge::ModuleBridge;
use crate::require_shim::{DirectoryModuleSource, ModuleSource, NativeRuntime, ScriptEvaluator};
use crate::trust_gate::{TrustGate, DEFAULT_PLUGIN_LABEL};
use crate::trust_store::TrustStore;

/// Embedder-provided pieces the host cannot construct itself.
pub struct HostServices {
    pub loader: Arc<dyn ModuleLoader>,
    pub evaluator: Arc<dyn ScriptEvaluator>,
    /// Named modules approved payloads may `require`.
    pub builtins: BTreeMap<String, Arc<dyn NativeModule>>,
}

/// Privileged-side context: owns the IPC handlers, trust gate and module
/// bridge for one host process.
#[derive(Clone)]
pub struct PrivilegedHost {
    config: HostConfig,
    ipc: Arc<IpcMain>,
    trust_gate: TrustGate,
    bridge: ModuleBridge,
    app_modules: Arc<DirectoryModuleSource>,
}

impl PrivilegedHost {
    pub fn new(config: HostConfig, services: HostServices, renderer: Arc<dyn RendererSink>) -> Self {
        let ipc = Arc::new(IpcMain::new());
        let app_modules = Arc::new(DirectoryModuleSource::new(config.app_dir.clone()));
        let runtime = NativeRuntime::with_builtins(
            services.evaluator,
            Arc::clone(&app_modules) as Arc<dyn ModuleSource>,
            services.builtins,
        );
        let trust_gate = TrustGate::new(
            TrustStore::load(&config.trust_store_path()),
            Arc::clone(&ipc),
            renderer,
            runtime,
        )
        .configured(config.namespace.clone(), config.trust_timeout());
        let bridge = ModuleBridge::new(config.bundle_dir.clone(), services.loader, Arc::clone(&ipc))
            .with_module_namespace(config.module_namespace.clone());

        Self {
            config,
            ipc,
            trust_gate,
            bridge,
            app_modules,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn ipc(&self) -> &Arc<IpcMain> {
        &self.ipc
    }

    pub fn trust_gate(&self) -> &TrustGate {
        &self.trust_gate
    }

    pub fn bridge(&self) -> &ModuleBridge {
        &self.bridge
    }

    /// Registers the host's invoke handlers. Calling it again replaces them.
    pub fn install(&self) {
        let namespace = &self.config.namespace;

        let bridge = self.bridge.clone();
        self.ipc.handle(load_native_channel(namespace), move |args: IpcArgs| {
            let bridge = bridge.clone();
            async move {
                let file_name = string_arg(&args, 0, "fileName")?;
                let logical_name = string_arg(&args, 1, "logicalName")?;
                let channel = bridge.load_module(&file_name, &logical_name).await?;
                Ok(Value::String(channel))
            }
        });

        let gate = self.trust_gate.clone();
        self.ipc.handle(register_native_channel(namespace), move |args: IpcArgs| {
            let gate = gate.clone();
            async move {
                let code = string_arg(&args, 0, "nativeCode")?;
                let plugin = args
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_PLUGIN_LABEL)
                    .to_string();
                gate.register_native(&code, &plugin).await?;
                Ok(Value::Null)
            }
        });

        let app_modules = Arc::clone(&self.app_modules);
        self.ipc.handle(read_module_channel(namespace), move |args: IpcArgs| {
            let app_modules = Arc::clone(&app_modules);
            async move {
                let path = string_arg(&args, 0, "path")?;
                let response = tokio::task::spawn_blocking(move || {
                    read_module_response(app_modules.as_ref(), &path)
                })
                .await
                .context("module read task failed")?;
                Ok(response)
            }
        });

        tracing::debug!(namespace = %namespace, handlers = self.ipc.handler_count(), "privileged host installed");
    }
}

fn read_module_response(source: &dyn ModuleSource, path: &str) -> Value {
    match source.read_module(path) {
        Ok(Some(code)) => json!({ "success": true, "code": code }),
        Ok(None) => json!({ "success": false }),
        Err(error) => {
            tracing::warn!(path, error = %format!("{error:#}"), "refused module read");
            json!({ "success": false })
        }
    }
}

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("argument {index} ({name}) must be a string"))
}
