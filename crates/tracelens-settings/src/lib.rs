//! # tracelens-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`TracelensSettings::default()`])
//! 2. **Settings file** (`~/.tracelens/settings.json` or an explicit path, deep-merged over defaults)
//! 3. **Environment variables** (`DATABASE_PATH`, `TRACELENS_*`, highest priority)
//!
//! The loaded value is handed to the store and engine at startup. Nothing in
//! the workspace reads settings from a global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
