//! Foundational utilities shared across Tether crates.
//!
//! Provides atomic file writes used by trust-store persistence, clock helpers
//! for trust-decision timestamps, and the settings export envelope.

pub mod atomic_io;
pub mod settings_transfer;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use settings_transfer::{
    dump_settings, parse_export, restore_settings, validate_export, ExportData, SettingsStore,
    SETTINGS_EXPORT_VERSION,
};
pub use time_utils::{current_rfc3339_timestamp, current_unix_timestamp_ms};
