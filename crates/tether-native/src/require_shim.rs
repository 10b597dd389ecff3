//! Restricted module resolution for approved native payloads.
//!
//! Payloads resolve bare ids only against an allow-list of builtin modules.
//! Relative ids are resolved against a virtual directory stack that mirrors the
//! payload's own module graph and are fetched through a [`ModuleSource`], never
//! from arbitrary local paths.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::module::{FnModule, NativeModule};

const MODULE_EXTENSION: &str = ".js";
const VIRTUAL_ROOT: &str = ".";

/// Evaluates module text into a native module. Nested `require` calls made by
/// the code go through `require`.
pub trait ScriptEvaluator: Send + Sync {
    fn evaluate(
        &self,
        code: &str,
        origin: &str,
        require: &mut RequireShim,
    ) -> Result<Arc<dyn NativeModule>>;
}

/// Fetches module text by virtual path. `Ok(None)` means not found.
pub trait ModuleSource: Send + Sync {
    fn read_module(&self, path: &str) -> Result<Option<String>>;
}

#[derive(Debug, Error)]
pub enum RequireError {
    #[error("module '{0}' is not in the require allow-list")]
    NotAllowed(String),
    #[error("failed to fetch module '{path}': {source:#}")]
    Fetch {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("module '{path}' failed to evaluate: {source:#}")]
    Evaluate {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Serves module files from one directory, refusing paths that leave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryModuleSource {
    root: PathBuf,
}

impl DirectoryModuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn validate_module_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        bail!("module path cannot be empty");
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("module path '{path}' escapes the module root");
            }
        }
    }
    Ok(())
}

impl ModuleSource for DirectoryModuleSource {
    fn read_module(&self, path: &str) -> Result<Option<String>> {
        validate_module_path(path)?;
        let candidate = self.root.join(path);
        if !candidate.is_file() {
            return Ok(None);
        }
        let root = self
            .root
            .canonicalize()
            .with_context(|| format!("failed to resolve module root {}", self.root.display()))?;
        let resolved = candidate
            .canonicalize()
            .with_context(|| format!("failed to resolve module {}", candidate.display()))?;
        if !resolved.starts_with(&root) {
            bail!("module path '{path}' resolves outside the module root");
        }
        let code = std::fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read module {}", resolved.display()))?;
        Ok(Some(code))
    }
}

/// Joins `relative` onto the virtual directory `base`. `..` never climbs above
/// the virtual root.
pub fn resolve_relative(base: &str, relative: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in base.split('/').chain(relative.split('/')) {
        match part {
            ".." => {
                parts.pop();
            }
            "" | "." => {}
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        VIRTUAL_ROOT.to_string()
    } else {
        parts.join("/")
    }
}

pub fn virtual_dirname(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => VIRTUAL_ROOT.to_string(),
    }
}

fn is_relative_id(id: &str) -> bool {
    id.starts_with("./") || id.starts_with("../")
}

fn module_path(base: &str, id: &str) -> String {
    let resolved = resolve_relative(base, id);
    if resolved.ends_with(MODULE_EXTENSION) {
        resolved
    } else {
        format!("{resolved}{MODULE_EXTENSION}")
    }
}

fn empty_module() -> Arc<dyn NativeModule> {
    Arc::new(FnModule::new())
}

/// Everything needed to run approved native code.
#[derive(Clone)]
pub struct NativeRuntime {
    evaluator: Arc<dyn ScriptEvaluator>,
    source: Arc<dyn ModuleSource>,
    builtins: Arc<BTreeMap<String, Arc<dyn NativeModule>>>,
}

impl NativeRuntime {
    pub fn new(evaluator: Arc<dyn ScriptEvaluator>, source: Arc<dyn ModuleSource>) -> Self {
        Self::with_builtins(evaluator, source, BTreeMap::new())
    }

    pub fn with_builtins(
        evaluator: Arc<dyn ScriptEvaluator>,
        source: Arc<dyn ModuleSource>,
        builtins: BTreeMap<String, Arc<dyn NativeModule>>,
    ) -> Self {
        Self {
            evaluator,
            source,
            builtins: Arc::new(builtins),
        }
    }

    pub fn builtin_names(&self) -> Vec<String> {
        self.builtins.keys().cloned().collect()
    }

    pub fn require_shim(&self) -> RequireShim {
        RequireShim {
            builtins: Arc::clone(&self.builtins),
            source: Arc::clone(&self.source),
            evaluator: Arc::clone(&self.evaluator),
            cache: HashMap::new(),
            dirs: vec![VIRTUAL_ROOT.to_string()],
        }
    }

    /// Evaluates `code` on the blocking pool with a fresh shim.
    pub async fn execute(&self, code: String, origin: String) -> Result<Arc<dyn NativeModule>> {
        let runtime = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut shim = runtime.require_shim();
            runtime.evaluator.evaluate(&code, &origin, &mut shim)
        })
        .await
        .context("native evaluation task failed")?
    }
}

/// Per-execution `require` implementation with its own module cache.
pub struct RequireShim {
    builtins: Arc<BTreeMap<String, Arc<dyn NativeModule>>>,
    source: Arc<dyn ModuleSource>,
    evaluator: Arc<dyn ScriptEvaluator>,
    cache: HashMap<String, Arc<dyn NativeModule>>,
    dirs: Vec<String>,
}

impl RequireShim {
    pub fn current_dir(&self) -> &str {
        self.dirs.last().map(String::as_str).unwrap_or(VIRTUAL_ROOT)
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.cache.contains_key(path)
    }

    pub fn require(&mut self, id: &str) -> Result<Arc<dyn NativeModule>, RequireError> {
        if let Some(module) = self.builtins.get(id) {
            return Ok(Arc::clone(module));
        }
        if !is_relative_id(id) {
            tracing::warn!(id, "blocked require outside the allow-list");
            return Err(RequireError::NotAllowed(id.to_string()));
        }

        let path = module_path(self.current_dir(), id);
        if let Some(module) = self.cache.get(&path) {
            return Ok(Arc::clone(module));
        }
        let code = match self.source.read_module(&path) {
            Ok(Some(code)) => code,
            Ok(None) => {
                tracing::warn!(id, path = %path, "required module not found; using empty module");
                return Ok(empty_module());
            }
            Err(source) => return Err(RequireError::Fetch { path, source }),
        };

        // Cycles observe the empty placeholder.
        self.cache.insert(path.clone(), empty_module());
        self.dirs.push(virtual_dirname(&path));
        let evaluator = Arc::clone(&self.evaluator);
        let result = evaluator.evaluate(&code, &path, self);
        self.dirs.pop();

        match result {
            Ok(module) => {
                self.cache.insert(path, Arc::clone(&module));
                Ok(module)
            }
            Err(source) => {
                self.cache.remove(&path);
                Err(RequireError::Evaluate { path, source })
            }
        }
    }
}
