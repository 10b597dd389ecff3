//! Restricted-side interception for Tether.
//!
//! Locates action builders inside opaque host bundles, rewrites them to call
//! through [`ActionPatcher`], and lets extensions observe or cancel actions via
//! [`InterceptorRegistry`]. Registrations are torn down through [`UnloadSet`].

pub mod locator;
pub mod patcher;
pub mod registry;
pub mod unload;

pub use locator::{
    locate, ActionLocator, Anchor, DeclarationShape, LocateReport, LocatedFunction,
    PREPARE_ACTION_ANCHOR, PREPARE_ACTION_LABEL, STORE_ACCESSOR_ANCHOR, STORE_ACCESSOR_LABEL,
};
pub use patcher::{
    export_store_accessor, noop_action, patch_source, transform_bundle, transform_bundle_with,
    ActionOutcome, ActionPatcher, BundleTransform, PatchedAction, NOOP_ACTION_TYPE,
    PATCH_ENTRYPOINT, STORE_EXPORT_NAME, UNPATCHED_PREFIX,
};
pub use registry::{DispatchOutcome, InterceptHandle, InterceptVerdict, InterceptorRegistry};
pub use unload::{Unload, UnloadReport, UnloadSet, UnloadStatus, UNLOAD_TIMEOUT_MS_DEFAULT};

/// Per-extension state on the restricted side: interceptors it registered and
/// the teardown set that removes them.
#[derive(Debug)]
pub struct ExtensionScope {
    source: String,
    registry: InterceptorRegistry,
    unloads: UnloadSet,
}

impl ExtensionScope {
    pub fn new(source: impl Into<String>, registry: InterceptorRegistry) -> Self {
        Self::with_unloads(source, registry, UnloadSet::new())
    }

    pub fn with_unloads(
        source: impl Into<String>,
        registry: InterceptorRegistry,
        unloads: UnloadSet,
    ) -> Self {
        Self {
            source: source.into(),
            registry,
            unloads,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn unloads(&self) -> &UnloadSet {
        &self.unloads
    }

    /// Subscribes under this extension's label and records the teardown.
    pub fn intercept<F>(&self, action: &str, once: bool, callback: F) -> InterceptHandle
    where
        F: Fn(&[serde_json::Value]) -> anyhow::Result<InterceptVerdict> + Send + Sync + 'static,
    {
        let handle = if once {
            self.registry.subscribe_once(action, &self.source, callback)
        } else {
            self.registry.subscribe(action, &self.source, callback)
        };
        self.unloads.add(handle.clone().into_unload());
        handle
    }

    pub async fn unload(&self) -> UnloadReport {
        self.unloads.unload_all().await
    }
}
