//! Privileged-side native bridge for Tether.
//!
//! Opaque native payloads pass through a consent [`TrustGate`] keyed by
//! content hash before they run under a restricted [`RequireShim`]. Bundled
//! native modules are loaded by [`ModuleBridge`] and exposed over per-module
//! invoke channels. [`PrivilegedHost`] wires both onto an [`tether_ipc::IpcMain`].

pub mod channels;
pub mod config;
pub mod host;
pub mod module;
pub mod module_bridge;
pub mod require_shim;
pub mod trust_gate;
pub mod trust_store;

#[cfg(test)]
mod test_support;

pub use channels::{
    load_native_channel, module_call_channel, read_module_channel, register_native_channel,
    request_trust_channel, trust_response_channel,
};
pub use config::{
    HostConfig, HOST_NAMESPACE_DEFAULT, MODULE_NAMESPACE_DEFAULT, TRUST_TIMEOUT_MS_DEFAULT,
};
pub use host::{HostServices, PrivilegedHost};
pub use module::{FnModule, ModuleLoader, NativeModule, ScriptModuleLoader, StaticModuleLoader};
pub use module_bridge::{validate_module_file_name, BridgeError, ModuleBridge};
pub use require_shim::{
    resolve_relative, virtual_dirname, DirectoryModuleSource, ModuleSource, NativeRuntime,
    RequireError, RequireShim, ScriptEvaluator,
};
pub use trust_gate::{
    RejectReason, TrustDecision, TrustError, TrustGate, TrustPhase, TrustVerdict,
    DEFAULT_PLUGIN_LABEL,
};
pub use trust_store::{
    content_hash, is_valid_content_hash, parse_trust_store, TrustStore, TRUST_STORE_FILE_NAME,
};
