//! Channel names used across the privileged/restricted boundary.

const REQUEST_TRUST: &str = "requestTrust";
const TRUST_RESPONSE: &str = "trustResponse";
const LOAD_NATIVE: &str = "loadNative";
const REGISTER_NATIVE: &str = "registerNative";
const READ_MODULE: &str = "readModule";

/// Privileged → restricted: `(pluginLabel, hash, timestampMs)`.
pub fn request_trust_channel(namespace: &str) -> String {
    format!("{namespace}.{REQUEST_TRUST}")
}

/// Restricted → privileged, one-shot: `(responseCode)`.
pub fn trust_response_channel(namespace: &str, hash: &str, timestamp_ms: u64) -> String {
    format!("{namespace}.{TRUST_RESPONSE}:{hash}:{timestamp_ms}")
}

pub fn load_native_channel(namespace: &str) -> String {
    format!("{namespace}.{LOAD_NATIVE}")
}

pub fn register_native_channel(namespace: &str) -> String {
    format!("{namespace}.{REGISTER_NATIVE}")
}

pub fn read_module_channel(namespace: &str) -> String {
    format!("{namespace}.{READ_MODULE}")
}

pub fn module_call_channel(module_namespace: &str, logical_name: &str) -> String {
    format!("{module_namespace}.{logical_name}")
}
