//! # peerio-updater
//!
//! Authenticated self-update pipeline for a desktop application.
//!
//! The crate discovers a release through a signed manifest, verifies the
//! signature against pinned signify-format Ed25519 keys, downloads the
//! platform artifact over a hardened HTTPS fetcher, verifies size and
//! SHA-512, and hands the validated artifact to a platform installer when
//! the host application quits.
//!
//! ## Security
//!
//! - Manifests verify against pinned public keys before any field is
//!   interpreted; the signed region is reconstructed byte for byte.
//! - Artifacts are hash- and size-verified before an installer sees them.
//! - All fetches are https-only, redirects included, with hard caps on
//!   redirects, retries and text response size.
//! - Key, signature and hash comparisons are constant-time.
//!
//! ## Crash safety
//!
//! Install attempts are recorded in `update-info.json` before the
//! installer runs. On the next startup
//! [`UpdateController::did_last_update_fail`] reports whether the version
//! ever advanced, and a retry can re-use the verified artifact still on
//! disk instead of downloading again.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerio_updater::{
//!     InstallerRegistry, ShutdownHost, UpdateConfig, UpdateController, UpdateEvent,
//! };
//!
//! # fn hosting() -> (Arc<dyn ShutdownHost>, InstallerRegistry) { unimplemented!() }
//! # async fn example() -> Result<(), peerio_updater::UpdateError> {
//! let (host, installers) = hosting();
//! let config = UpdateConfig::new(
//!     env!("CARGO_PKG_VERSION"),
//!     vec!["<base64 public key>".to_string()],
//!     vec!["github:peerio/peerio-desktop".to_string()],
//! );
//!
//! let controller = UpdateController::new(config, installers, host)?;
//! let mut events = controller.subscribe();
//!
//! controller.check_periodically(None).await;
//! while let Ok(event) = events.recv().await {
//!     if let UpdateEvent::Downloaded(path, manifest) = event {
//!         println!("update {} ready at {}", manifest.version(), path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod config;
#[cfg(test)]
mod proptests;
pub mod controller;
pub mod error;
pub mod events;
pub mod fetch;
pub mod install;
pub mod manifest;
pub mod platform;
pub mod recovery;
pub mod signify;

pub use config::{UpdateConfig, ValidatedConfig};
pub use controller::{
    ShutdownHook, ShutdownHost, UpdateController, DEFAULT_CHECK_INTERVAL, MIN_CHECK_INTERVAL,
};
pub use error::UpdateError;
pub use events::UpdateEvent;
pub use fetch::Fetcher;
pub use install::{HookInstaller, Installer, InstallerRegistry};
pub use manifest::{Manifest, ManifestBuilder};
pub use recovery::{InstallLedger, UpdateInfo};
pub use signify::{generate_keypair, PublicKey, SecretKey};
