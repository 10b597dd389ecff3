//! Native modules and the loaders that produce them.

use std::{collections::BTreeMap, fmt, future::Future, path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::require_shim::NativeRuntime;

/// Exported functions of a loaded native module.
#[async_trait]
pub trait NativeModule: Send + Sync {
    fn exports(&self) -> Vec<String>;

    async fn call(&self, export: &str, args: Vec<Value>) -> Result<Value>;
}

impl fmt::Debug for dyn NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("exports", &self.exports())
            .finish()
    }
}

type ExportFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Module assembled from Rust closures. `FnModule::new()` is the empty module.
#[derive(Clone, Default)]
pub struct FnModule {
    exports: BTreeMap<String, ExportFn>,
}

impl fmt::Debug for FnModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnModule")
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FnModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export<F, Fut>(mut self, name: impl Into<String>, export: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let export: ExportFn = Arc::new(move |args| export(args).boxed());
        self.exports.insert(name.into(), export);
        self
    }

    pub fn with_sync_export<F>(self, name: impl Into<String>, export: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let export = Arc::new(export);
        self.with_export(name, move |args| {
            let export = Arc::clone(&export);
            async move { export(args) }
        })
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }
}

#[async_trait]
impl NativeModule for FnModule {
    fn exports(&self) -> Vec<String> {
        self.exports.keys().cloned().collect()
    }

    async fn call(&self, export: &str, args: Vec<Value>) -> Result<Value> {
        let function = self
            .exports
            .get(export)
            .cloned()
            .ok_or_else(|| anyhow!("export '{export}' is not a function"))?;
        function(args).await
    }
}

/// Turns a file in the trusted bundle directory into a module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<Arc<dyn NativeModule>>;
}

/// Loader for modules compiled into the host, keyed by bundle file name. The
/// file must still exist on disk.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: BTreeMap<String, Arc<dyn NativeModule>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, file_name: impl Into<String>, module: Arc<dyn NativeModule>) -> Self {
        self.modules.insert(file_name.into(), module);
        self
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, path: &Path) -> Result<Arc<dyn NativeModule>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat native module {}", path.display()))?;
        if !metadata.is_file() {
            bail!("native module path '{}' is not a file", path.display());
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("native module path '{}' has no file name", path.display()))?;
        self.modules
            .get(file_name)
            .cloned()
            .ok_or_else(|| anyhow!("no native module is registered for '{file_name}'"))
    }
}

/// Loader that reads module source and evaluates it with a fresh require shim.
#[derive(Clone)]
pub struct ScriptModuleLoader {
    runtime: NativeRuntime,
}

impl ScriptModuleLoader {
    pub fn new(runtime: NativeRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ModuleLoader for ScriptModuleLoader {
    async fn load(&self, path: &Path) -> Result<Arc<dyn NativeModule>> {
        let code = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read native module {}", path.display()))?;
        self.runtime.execute(code, path.display().to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn unit_fn_module_calls_sync_and_async_exports() {
        let module = FnModule::new()
            .with_sync_export("add", |args| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
            .with_export("greet", |args| async move {
                Ok(json!(format!("hi {}", args[0].as_str().unwrap_or("?"))))
            });

        assert_eq!(module.exports(), vec!["add".to_string(), "greet".to_string()]);
        assert_eq!(
            module.call("add", vec![json!(2), json!(3)]).await.expect("add"),
            json!(5)
        );
        assert_eq!(
            module.call("greet", vec![json!("ana")]).await.expect("greet"),
            json!("hi ana")
        );
    }

    #[tokio::test]
    async fn regression_unknown_export_is_not_a_function() {
        let error = FnModule::new()
            .call("missing", Vec::new())
            .await
            .expect_err("unknown export");
        assert_eq!(error.to_string(), "export 'missing' is not a function");
    }

    #[tokio::test]
    async fn functional_static_loader_requires_file_and_registration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let present = temp.path().join("audio.native.mjs");
        std::fs::write(&present, "// compiled in").expect("write module file");
        let unregistered = temp.path().join("other.native.mjs");
        std::fs::write(&unregistered, "").expect("write module file");

        let loader = StaticModuleLoader::new().with_module(
            "audio.native.mjs",
            Arc::new(FnModule::new().with_sync_export("ping", |_| Ok(json!("pong")))),
        );

        let module = loader.load(&present).await.expect("load registered module");
        assert_eq!(module.call("ping", Vec::new()).await.expect("ping"), json!("pong"));

        assert!(loader
            .load(&temp.path().join("missing.native.mjs"))
            .await
            .is_err());
        let error = loader.load(&unregistered).await.expect_err("unregistered");
        assert!(error.to_string().contains("other.native.mjs"));
    }

    #[tokio::test]
    async fn functional_script_loader_evaluates_file_with_require_shim() {
        use crate::test_support::{LineEvaluator, MapModuleSource};

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tray.native.mjs");
        std::fs::write(&path, "require ./icons\nexport tray \"ok\"").expect("write module file");
        let runtime = NativeRuntime::new(
            Arc::new(LineEvaluator),
            Arc::new(MapModuleSource::new(&[("icons.js", "export play 1")])),
        );

        let module = ScriptModuleLoader::new(runtime)
            .load(&path)
            .await
            .expect("evaluate module");
        assert_eq!(
            module.call("dep:./icons", Vec::new()).await.expect("dep"),
            json!(["play"])
        );
        assert_eq!(module.call("tray", Vec::new()).await.expect("tray"), json!("ok"));
    }
}
