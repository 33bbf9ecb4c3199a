#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Host configuration for Tabula: where plugins live, how they are
//! sandboxed, how long audit records are kept and how the host logs.
//!
//! ```rust,no_run
//! use tabula_config::Config;
//!
//! # fn main() -> tabula_config::ConfigResult<()> {
//! let resolved = Config::load(Some(std::path::Path::new(".")))?;
//! for dir in &resolved.config.plugins.directories {
//!     println!("plugins from {}", dir.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Layers, later ones winning:
//!
//! 1. `defaults.toml`, embedded at build time
//! 2. `/etc/tabula/config.toml`
//! 3. `~/.tabula/config.toml`
//! 4. `{workspace}/.tabula/config.toml`
//!
//! `TABULA_*` environment variables fill only the fields no file set.
//!
//! The crate depends on no other Tabula crate. Turning sections into
//! sandbox limits, logging setup or plugin manager settings is left to the
//! crates that own those types.

/// `TABULA_*` environment fallbacks.
pub mod env;
/// Error types.
pub mod error;
/// Layer discovery and loading.
pub mod loader;
/// TOML tree merging.
pub mod merge;
/// Section types.
pub mod types;
/// Range checks.
pub mod validate;

use std::path::Path;

pub use error::{ConfigError, ConfigResult};
pub use loader::ResolvedConfig;
pub use merge::ConfigLayer;
pub use types::*;

impl Config {
    /// Resolve every layer for `workspace_root` and the current user.
    ///
    /// # Errors
    ///
    /// Fails on an unreadable, oversized or malformed layer, or when the
    /// merged result does not validate.
    pub fn load(workspace_root: Option<&Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(workspace_root, None)
    }

    /// Like [`load`](Self::load), reading the user layer below `home_dir`.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn load_with_home(
        workspace_root: Option<&Path>,
        home_dir: &Path,
    ) -> ConfigResult<ResolvedConfig> {
        loader::load(workspace_root, Some(home_dir))
    }

    /// Read one complete file. Missing sections take their defaults; no
    /// other layer is consulted.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, oversized or malformed, or
    /// does not validate.
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
