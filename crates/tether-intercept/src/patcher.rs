//! Rewrites located host functions so their calls pass through the
//! interception registry, and the runtime wrapper those rewrites call into.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use serde_json::{json, Value};

use crate::locator::{
    ActionLocator, LocatedFunction, PREPARE_ACTION_LABEL, STORE_ACCESSOR_LABEL,
};
use crate::registry::InterceptorRegistry;

pub const UNPATCHED_PREFIX: &str = "__TetherUnpatched_";
pub const PATCH_ENTRYPOINT: &str = "tether.patchAction";
pub const STORE_EXPORT_NAME: &str = "hijackedGetStore";
pub const NOOP_ACTION_TYPE: &str = "NOOP";

const FUNCTION_KEYWORD: &str = "function ";

/// Renames the declaration at `located.offset` and binds the original name to
/// the patched wrapper. Returns `None` when the declaration is not preceded by
/// the `function ` keyword.
pub fn patch_source(code: &str, located: &LocatedFunction) -> Option<String> {
    let keyword_idx = located.offset.checked_sub(FUNCTION_KEYWORD.len())?;
    if code.get(keyword_idx..located.offset)? != FUNCTION_KEYWORD {
        return None;
    }
    if !code.get(located.offset..)?.starts_with(located.name.as_str()) {
        return None;
    }

    let name = &located.name;
    let binding = format!("const {name} = {PATCH_ENTRYPOINT}({{ _: {UNPATCHED_PREFIX}{name} }})._;");
    let mut patched =
        String::with_capacity(code.len() + binding.len() + UNPATCHED_PREFIX.len());
    patched.push_str(&code[..keyword_idx]);
    patched.push_str(&binding);
    patched.push_str(FUNCTION_KEYWORD);
    patched.push_str(UNPATCHED_PREFIX);
    patched.push_str(&code[located.offset..]);
    Some(patched)
}

/// Appends an export exposing the located store accessor.
pub fn export_store_accessor(code: &str, located: &LocatedFunction) -> String {
    format!("{code}; export {{ {} as {STORE_EXPORT_NAME} }};", located.name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleTransform {
    pub code: String,
    pub store_accessor: Option<String>,
    pub patched_action: Option<String>,
    pub missing: Vec<String>,
}

impl BundleTransform {
    pub fn is_modified(&self) -> bool {
        self.store_accessor.is_some() || self.patched_action.is_some()
    }
}

/// Runs the built-in anchors over one module payload and applies every patch
/// that matched. Payloads without anchors come back unchanged.
pub fn transform_bundle(code: &str) -> BundleTransform {
    transform_bundle_with(&ActionLocator::default(), code)
}

pub fn transform_bundle_with(locator: &ActionLocator, code: &str) -> BundleTransform {
    let report = locator.locate_all(code);
    let mut transform = BundleTransform {
        code: code.to_string(),
        missing: report.missing.clone(),
        ..BundleTransform::default()
    };

    if let Some(located) = report.get(PREPARE_ACTION_LABEL) {
        match patch_source(&transform.code, located) {
            Some(patched) => {
                transform.code = patched;
                transform.patched_action = Some(located.name.clone());
            }
            None => {
                tracing::warn!(name = %located.name, "prepare-action declaration has an unexpected shape; not patched");
                transform.missing.push(PREPARE_ACTION_LABEL.to_string());
            }
        }
    }
    if let Some(located) = report.get(STORE_ACCESSOR_LABEL) {
        transform.code = export_store_accessor(&transform.code, located);
        transform.store_accessor = Some(located.name.clone());
    }
    transform
}

type ActionBuilder = dyn Fn(&[Value]) -> Value + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Dispatched(Value),
    Cancelled,
}

impl ActionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The original's result, or the neutral `{"type": "NOOP"}` action.
    pub fn into_value(self) -> Value {
        match self {
            Self::Dispatched(value) => value,
            Self::Cancelled => noop_action(),
        }
    }
}

pub fn noop_action() -> Value {
    json!({ "type": NOOP_ACTION_TYPE })
}

/// Wrapper owning the original builder and the registry it dispatches through.
pub struct PatchedAction {
    action_type: String,
    original: Arc<ActionBuilder>,
    registry: InterceptorRegistry,
}

impl fmt::Debug for PatchedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchedAction")
            .field("action_type", &self.action_type)
            .finish_non_exhaustive()
    }
}

impl PatchedAction {
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn invoke(&self, args: &[Value]) -> ActionOutcome {
        let dispatch = self.registry.dispatch(&self.action_type, args);
        if dispatch.cancelled {
            tracing::debug!(action = %self.action_type, invoked = dispatch.invoked, "action cancelled by interceptor");
            return ActionOutcome::Cancelled;
        }
        ActionOutcome::Dispatched((self.original)(args))
    }

    pub fn call(&self, args: &[Value]) -> Value {
        self.invoke(args).into_value()
    }
}

/// Holds the latest patched builder per action type.
#[derive(Debug)]
pub struct ActionPatcher {
    registry: InterceptorRegistry,
    builders: Mutex<HashMap<String, Arc<PatchedAction>>>,
}

impl ActionPatcher {
    pub fn new(registry: InterceptorRegistry) -> Self {
        Self {
            registry,
            builders: Mutex::new(HashMap::new()),
        }
    }

    fn builders(&self) -> MutexGuard<'_, HashMap<String, Arc<PatchedAction>>> {
        self.builders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &InterceptorRegistry {
        &self.registry
    }

    /// Wraps `original` for `action_type`. The host may build the same type
    /// more than once; the newest wrapper replaces the cached one.
    pub fn patch<F>(&self, action_type: impl Into<String>, original: F) -> Arc<PatchedAction>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let action_type = action_type.into();
        let patched = Arc::new(PatchedAction {
            action_type: action_type.clone(),
            original: Arc::new(original),
            registry: self.registry.clone(),
        });
        self.builders().insert(action_type, Arc::clone(&patched));
        patched
    }

    pub fn builder(&self, action_type: &str) -> Option<Arc<PatchedAction>> {
        self.builders().get(action_type).cloned()
    }

    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.builders().keys().cloned().collect();
        types.sort();
        types
    }

    /// Calls the cached builder for `action_type`, if one was patched.
    pub fn dispatch(&self, action_type: &str, args: &[Value]) -> Option<Value> {
        let builder = self.builder(action_type)?;
        Some(builder.call(args))
    }
}
