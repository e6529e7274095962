//! # helm-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HelmSettings::default()`]
//! 2. **Settings file**: `~/.helm/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `HELM_*` overrides (highest priority)
//!
//! There is no global instance: the binary loads settings once and hands the
//! relevant sections to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path, validate,
};
pub use types::*;
