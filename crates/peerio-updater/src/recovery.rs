//! Crash-safe install bookkeeping.
//!
//! Before an installer runs, the controller records what it is about to do
//! in `update-info.json` inside the downloads directory. On the next
//! startup the record answers two questions: did the last install fail
//! (the running version never advanced), and is the previously downloaded
//! artifact still on disk and intact so a retry can skip the download.
//! Cleanup deletes artifacts only when they live under the downloads
//! directory and swallows filesystem errors; a failed cleanup must never
//! take the application down.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::error::UpdateError;

/// File name of the persisted record inside the downloads directory.
pub const UPDATE_INFO_FILE: &str = "update-info.json";

/// Persisted record of an install attempt.
///
/// All fields are required; a record missing any of them is invalid and
/// is treated as absent by recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// How many installs of this update have been attempted.
    pub attempts: u32,
    /// Application version that was running when the attempt was made.
    pub current_version: String,
    /// Version the update would install.
    pub update_version: String,
    /// Expected artifact size in bytes.
    pub update_size: u64,
    /// Expected artifact SHA-512 (hex).
    pub update_hash: String,
    /// Path of the downloaded artifact.
    pub update_file: PathBuf,
}

/// Reader/writer for the update-info ledger.
#[derive(Debug, Clone)]
pub struct InstallLedger {
    downloads_dir: PathBuf,
}

impl InstallLedger {
    /// Create a ledger rooted at the downloads directory.
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self { downloads_dir }
    }

    /// Path of the ledger file.
    pub fn info_path(&self) -> PathBuf {
        self.downloads_dir.join(UPDATE_INFO_FILE)
    }

    /// Write a record by whole-file replacement.
    pub async fn record(&self, info: &UpdateInfo) -> Result<(), UpdateError> {
        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let content = serde_json::to_string_pretty(info)?;
        tokio::fs::write(self.info_path(), content).await?;
        tracing::debug!(
            attempts = info.attempts,
            update_version = %info.update_version,
            "recorded install attempt"
        );
        Ok(())
    }

    /// Load the record, if one exists.
    ///
    /// A missing file is `Ok(None)`; an unreadable or incomplete record is
    /// [`UpdateError::UpdateInfoInvalid`].
    pub async fn load(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        let path = self.info_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info: UpdateInfo = serde_json::from_str(&content)
            .map_err(|e| UpdateError::UpdateInfoInvalid(e.to_string()))?;
        Ok(Some(info))
    }

    /// Whether the last recorded install attempt failed.
    ///
    /// True iff a record can be read and its `current_version` equals the
    /// version running now, i.e. the install never advanced the version.
    pub async fn did_last_update_fail(&self, current_version: &str) -> bool {
        match self.load().await {
            Ok(Some(info)) => info.current_version == current_version,
            _ => false,
        }
    }

    /// Validate that the recorded artifact is still usable.
    ///
    /// The path must lie under the downloads directory and the file must
    /// match the recorded size and hash.
    pub async fn valid_update_file(&self, info: &UpdateInfo) -> Result<PathBuf, UpdateError> {
        if !info.update_file.starts_with(&self.downloads_dir) {
            return Err(UpdateError::UpdateInfoInvalid(format!(
                "recorded artifact {} is outside the downloads directory",
                info.update_file.display()
            )));
        }
        artifact::verify_size(info.update_size, &info.update_file).await?;
        artifact::verify_hash(&info.update_hash, &info.update_file).await?;
        Ok(info.update_file.clone())
    }

    /// Remove the recorded artifact and the record itself.
    ///
    /// The artifact is deleted only when it resides under the downloads
    /// directory. All filesystem errors are swallowed.
    pub async fn cleanup(&self) {
        if let Ok(Some(info)) = self.load().await {
            if info.update_file.starts_with(&self.downloads_dir) {
                if let Err(e) = tokio::fs::remove_file(&info.update_file).await {
                    tracing::debug!(
                        path = %info.update_file.display(),
                        error = %e,
                        "could not remove update artifact"
                    );
                }
            } else {
                tracing::warn!(
                    path = %info.update_file.display(),
                    "recorded artifact is outside the downloads directory, leaving it alone"
                );
            }
        }
        if let Err(e) = tokio::fs::remove_file(self.info_path()).await {
            tracing::debug!(error = %e, "could not remove update info file");
        }
    }

    /// The downloads directory this ledger is rooted at.
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }
}
