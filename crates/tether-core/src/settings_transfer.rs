//! Export/import envelope for extension settings and storage blobs.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time_utils::current_rfc3339_timestamp;

pub const SETTINGS_EXPORT_VERSION: u32 = 1;

/// Key/value store that can be dumped into and restored from an export.
pub trait SettingsStore {
    fn name(&self) -> &str;
    fn entries(&self) -> Result<BTreeMap<String, Value>>;
    fn clear(&mut self) -> Result<()>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub version: u32,
    pub timestamp: String,
    pub stores: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub feature_flags: Option<BTreeMap<String, bool>>,
}

/// Returns true when `raw` is a version 1 export with an object `stores` field.
pub fn validate_export(raw: &Value) -> bool {
    let Some(object) = raw.as_object() else {
        return false;
    };
    if object.get("version").and_then(Value::as_u64) != Some(u64::from(SETTINGS_EXPORT_VERSION)) {
        return false;
    }
    matches!(object.get("stores"), Some(Value::Object(_)))
}

pub fn parse_export(raw: &str) -> Result<ExportData> {
    let value: Value = serde_json::from_str(raw).context("settings export is not valid JSON")?;
    if !validate_export(&value) {
        bail!("settings export must be version {SETTINGS_EXPORT_VERSION} with a stores object");
    }
    serde_json::from_value(value).context("settings export has an invalid shape")
}

pub fn dump_settings(
    stores: &[&dyn SettingsStore],
    feature_flags: Option<BTreeMap<String, bool>>,
) -> Result<ExportData> {
    let mut dumped = BTreeMap::new();
    for store in stores {
        let entries = store
            .entries()
            .with_context(|| format!("failed to dump settings store '{}'", store.name()))?;
        dumped.insert(store.name().to_string(), entries);
    }
    Ok(ExportData {
        version: SETTINGS_EXPORT_VERSION,
        timestamp: current_rfc3339_timestamp(),
        stores: dumped,
        feature_flags,
    })
}

/// Replaces the contents of every store named in `data`. Stores missing from
/// the export are left untouched.
pub fn restore_settings(data: &ExportData, stores: &mut [&mut dyn SettingsStore]) -> Result<()> {
    for store in stores.iter_mut() {
        let Some(entries) = data.stores.get(store.name()) else {
            continue;
        };
        let name = store.name().to_string();
        store
            .clear()
            .with_context(|| format!("failed to clear settings store '{name}'"))?;
        for (key, value) in entries {
            store
                .set(key, value.clone())
                .with_context(|| format!("failed to restore '{key}' into '{name}'"))?;
        }
    }
    Ok(())
}
