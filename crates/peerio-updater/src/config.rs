//! Updater configuration.
//!
//! The host application supplies this at startup, usually deserialized
//! from a packaging descriptor. [`UpdateConfig::validate`] turns the raw
//! strings into the typed values the controller runs on; nothing else in
//! the crate accepts unvalidated configuration.

use std::path::PathBuf;

use semver::Version;
use serde::Deserialize;

use crate::error::UpdateError;
use crate::signify::PublicKey;

/// Raw updater configuration as supplied by the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfig {
    /// Current application version (semver).
    pub version: String,

    /// Base64 signify public keys trusted to sign manifests.
    pub public_keys: Vec<String>,

    /// Manifest locations, tried in order. Either an https URL or a
    /// `github:<owner>/<repo>` reference.
    pub manifests: Vec<String>,

    /// Whether this build follows the nightly release track. Selects the
    /// installer variant, never the manifest URLs.
    #[serde(default)]
    pub nightly: bool,

    /// Whether GitHub prereleases are eligible when resolving
    /// `github:` manifest references.
    #[serde(default)]
    pub allow_prerelease: bool,

    /// Whether a downloaded update arms the install-on-quit hook without
    /// further ado.
    #[serde(default)]
    pub auto_install: bool,

    /// Directory for downloaded artifacts and the update-info ledger.
    /// Defaults to `peerio-updater` under the OS temp directory.
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
}

impl UpdateConfig {
    /// Convenience constructor for the required fields.
    pub fn new(version: &str, public_keys: Vec<String>, manifests: Vec<String>) -> Self {
        Self {
            version: version.to_string(),
            public_keys,
            manifests,
            nightly: false,
            allow_prerelease: false,
            auto_install: false,
            downloads_dir: None,
        }
    }

    /// Parse a configuration from a JSON descriptor.
    pub fn from_json(text: &str) -> Result<Self, UpdateError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| UpdateError::ConfigInvalid(format!("bad descriptor: {e}")))?;
        Ok(config)
    }

    /// Validate the configuration into its typed form.
    pub fn validate(self) -> Result<ValidatedConfig, UpdateError> {
        let version = Version::parse(&self.version).map_err(|e| {
            UpdateError::ConfigInvalid(format!("version {:?} is not semver: {e}", self.version))
        })?;

        if self.manifests.is_empty() {
            return Err(UpdateError::ConfigInvalid(
                "at least one manifest URL is required".to_string(),
            ));
        }
        if self.public_keys.is_empty() {
            return Err(UpdateError::ConfigInvalid(
                "at least one public key is required".to_string(),
            ));
        }

        let mut public_keys = Vec::with_capacity(self.public_keys.len());
        for key in &self.public_keys {
            public_keys.push(PublicKey::from_base64(key).map_err(|e| {
                UpdateError::ConfigInvalid(format!("bad public key: {e}"))
            })?);
        }

        let downloads_dir = self
            .downloads_dir
            .unwrap_or_else(|| std::env::temp_dir().join("peerio-updater"));

        Ok(ValidatedConfig {
            version,
            public_keys,
            manifests: self.manifests,
            nightly: self.nightly,
            allow_prerelease: self.allow_prerelease,
            auto_install: self.auto_install,
            downloads_dir,
        })
    }
}

/// Configuration after validation; what the controller actually holds.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    /// Current application version.
    pub version: Version,
    /// Parsed trusted public keys.
    pub public_keys: Vec<PublicKey>,
    /// Manifest locations in priority order.
    pub manifests: Vec<String>,
    /// Nightly installer track.
    pub nightly: bool,
    /// GitHub prereleases eligible.
    pub allow_prerelease: bool,
    /// Arm install-on-quit automatically after download.
    pub auto_install: bool,
    /// Downloads directory.
    pub downloads_dir: PathBuf,
}
