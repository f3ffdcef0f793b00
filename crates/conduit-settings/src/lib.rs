//! # conduit-settings
//!
//! Configuration with layered sources for the Conduit server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConduitSettings::default()`]
//! 2. **Settings file**: `~/.conduit/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**: `CONDUIT_*` overrides (highest priority)
//!
//! Unlike a global singleton, the loaded value is handed to each transport at
//! construction, so several differently configured transports can coexist in
//! one process.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
