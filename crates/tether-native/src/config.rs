use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::trust_store::TRUST_STORE_FILE_NAME;

pub const HOST_NAMESPACE_DEFAULT: &str = "tether";
pub const MODULE_NAMESPACE_DEFAULT: &str = "tetherNative";
pub const TRUST_TIMEOUT_MS_DEFAULT: u64 = 60_000;
const TRUST_TIMEOUT_MS_MAX: u64 = 600_000;

/// Paths and limits for the privileged host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Trusted directory native module files are loaded from.
    pub bundle_dir: PathBuf,
    /// Host application directory served to the require shim.
    pub app_dir: PathBuf,
    /// Per-user state; holds the trust store.
    pub user_data_dir: PathBuf,
    pub namespace: String,
    pub module_namespace: String,
    pub trust_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        let root = PathBuf::from(".tether");
        Self {
            bundle_dir: root.join("bundle"),
            app_dir: root.join("app"),
            user_data_dir: root.join("user-data"),
            namespace: HOST_NAMESPACE_DEFAULT.to_string(),
            module_namespace: MODULE_NAMESPACE_DEFAULT.to_string(),
            trust_timeout_ms: TRUST_TIMEOUT_MS_DEFAULT,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read host config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse host config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_namespace("namespace", &self.namespace)?;
        validate_namespace("module_namespace", &self.module_namespace)?;
        if self.namespace == self.module_namespace {
            bail!("host config 'namespace' and 'module_namespace' must differ");
        }
        if self.trust_timeout_ms == 0 {
            bail!("host config 'trust_timeout_ms' must be greater than 0");
        }
        if self.trust_timeout_ms > TRUST_TIMEOUT_MS_MAX {
            bail!(
                "host config 'trust_timeout_ms' must be <= {}",
                TRUST_TIMEOUT_MS_MAX
            );
        }
        Ok(())
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.user_data_dir.join(TRUST_STORE_FILE_NAME)
    }

    pub fn trust_timeout(&self) -> Duration {
        Duration::from_millis(self.trust_timeout_ms)
    }
}

fn validate_namespace(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if !valid {
        bail!("host config '{field}' must be a non-empty ascii identifier, got '{value}'");
    }
    Ok(())
}
