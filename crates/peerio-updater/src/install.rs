//! Installer dispatch.
//!
//! Installers are opaque external collaborators: replacing files,
//! elevating privileges and relaunching the application all happen on the
//! other side of the [`Installer`] trait. This module only owns the
//! dispatch — a fixed lookup from host OS and the nightly flag to the
//! installer the host registered for that combination.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::UpdateError;

/// A platform installer.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the verified artifact. When `restart` is set the installer
    /// relaunches the application after replacing it.
    async fn install(&self, artifact: &Path, restart: bool) -> Result<(), UpdateError>;

    /// Short description for logging.
    fn description(&self) -> &str;
}

/// Dispatch table from (host OS, nightly) to a registered installer.
///
/// Built once at startup; lookups never mutate it.
#[derive(Default)]
pub struct InstallerRegistry {
    entries: Vec<((&'static str, bool), Arc<dyn Installer>)>,
}

impl InstallerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an installer for an OS (`"macos"`, `"linux"`, `"windows"`)
    /// and release track. Later registrations for the same combination
    /// replace earlier ones.
    pub fn register(mut self, os: &'static str, nightly: bool, installer: Arc<dyn Installer>) -> Self {
        self.entries.retain(|(key, _)| *key != (os, nightly));
        self.entries.push(((os, nightly), installer));
        self
    }

    /// Register the same installer for both release tracks of an OS.
    pub fn register_both_tracks(self, os: &'static str, installer: Arc<dyn Installer>) -> Self {
        self.register(os, false, installer.clone()).register(os, true, installer)
    }

    /// Look up the installer for an OS and release track.
    pub fn select(&self, os: &str, nightly: bool) -> Result<Arc<dyn Installer>, UpdateError> {
        self.entries
            .iter()
            .find(|(key, _)| key.0 == os && key.1 == nightly)
            .map(|(_, installer)| Arc::clone(installer))
            .ok_or(UpdateError::UnknownPlatformInstaller)
    }

    /// Look up the installer for the running host.
    pub fn select_host(&self, nightly: bool) -> Result<Arc<dyn Installer>, UpdateError> {
        self.select(std::env::consts::OS, nightly)
    }
}

/// Installer adapter around a host-supplied closure.
///
/// Lets hosts wire their existing install entry point in without
/// implementing the trait by hand; also what tests use.
pub struct HookInstaller<F> {
    hook: F,
    description: String,
}

impl<F> HookInstaller<F>
where
    F: Fn(&Path, bool) -> Result<(), UpdateError> + Send + Sync,
{
    /// Wrap an install function.
    pub fn new(description: &str, hook: F) -> Self {
        Self {
            hook,
            description: description.to_string(),
        }
    }
}

#[async_trait]
impl<F> Installer for HookInstaller<F>
where
    F: Fn(&Path, bool) -> Result<(), UpdateError> + Send + Sync,
{
    async fn install(&self, artifact: &Path, restart: bool) -> Result<(), UpdateError> {
        tracing::info!(
            installer = %self.description,
            artifact = %artifact.display(),
            restart,
            "running installer"
        );
        (self.hook)(artifact, restart)
    }

    fn description(&self) -> &str {
        &self.description
    }
}
