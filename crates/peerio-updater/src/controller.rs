//! Update orchestration.
//!
//! The controller sequences the whole pipeline: fetch and verify a
//! manifest, compare versions, download and verify the platform artifact,
//! persist the install attempt, and hand the artifact to the platform
//! installer when the host quits. It owns its state exclusively and
//! serialises itself: one check and at most one download are in flight at
//! any time, and redundant periodic ticks are dropped.
//!
//! Observable progress goes out on a typed event stream; see
//! [`UpdateEvent`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use rand_core::{OsRng, RngCore};
use semver::Version;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::artifact;
use crate::config::{UpdateConfig, ValidatedConfig};
use crate::error::UpdateError;
use crate::events::{EventBus, UpdateEvent};
use crate::fetch::Fetcher;
use crate::install::InstallerRegistry;
use crate::manifest::Manifest;
use crate::platform;
use crate::recovery::{InstallLedger, UpdateInfo};
use crate::signify::PublicKey;

/// Periodic checks never run more often than this.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default periodic check interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60 * 60);

/// Downloaded artifacts are named `peerio-update-<hex>.tmp`.
const TMP_PREFIX: &str = "peerio-update-";
const TMP_SUFFIX: &str = ".tmp";

/// Random bytes in a temp artifact name.
const TMP_RANDOM_BYTES: usize = 10;

/// Asset name looked up in GitHub releases.
const GITHUB_MANIFEST_ASSET: &str = "manifest.txt";

/// GitHub API endpoint used for `github:` manifest references.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// One-shot before-quit callback handed to the host. The host cancels its
/// quit, runs the returned future to completion, then exits.
pub type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// The narrow seam to the host application's lifecycle.
///
/// Injected at construction; the controller never touches global process
/// state to arrange installation.
pub trait ShutdownHost: Send + Sync {
    /// Register the install-on-quit hook. Called at most once per
    /// controller.
    fn on_shutdown(&self, hook: ShutdownHook);

    /// Ask the host application to quit.
    fn request_quit(&self);

    /// Ask the host to relaunch the application after it exits.
    fn request_relaunch(&self);

    /// Executable path exported by the packaging layer for relaunching
    /// (Linux). `None` where the platform does not need it.
    fn relaunch_executable(&self) -> Option<PathBuf> {
        None
    }

    /// Receive the executable path to exec after an install that
    /// restarts.
    fn set_relaunch_path(&self, exe: PathBuf) {
        let _ = exe;
    }
}

#[derive(Default)]
struct ControllerState {
    checking: bool,
    downloading: bool,
    new_version: Option<Arc<Manifest>>,
    downloaded_file: Option<PathBuf>,
    exit_hook_armed: bool,
    restart: bool,
    last_check: Option<Instant>,
}

/// The update controller.
///
/// Construct with [`UpdateController::new`], subscribe to events, then
/// drive it with [`check_for_updates`](Self::check_for_updates) or
/// [`check_periodically`](Self::check_periodically).
pub struct UpdateController {
    current_version: Version,
    public_keys: Vec<PublicKey>,
    manifest_urls: Vec<String>,
    nightly: bool,
    allow_prerelease: bool,
    auto_install: bool,
    downloads_dir: PathBuf,
    github_api_base: String,
    fetcher: Fetcher,
    ledger: InstallLedger,
    installers: InstallerRegistry,
    host: Arc<dyn ShutdownHost>,
    events: EventBus,
    state: RwLock<ControllerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateController {
    /// Validate the configuration and build a controller.
    pub fn new(
        config: UpdateConfig,
        installers: InstallerRegistry,
        host: Arc<dyn ShutdownHost>,
    ) -> Result<Arc<Self>, UpdateError> {
        let validated = config.validate()?;
        Ok(Self::assemble(
            validated,
            installers,
            host,
            Fetcher::new(),
            GITHUB_API_BASE.to_string(),
        ))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        config: ValidatedConfig,
        installers: InstallerRegistry,
        host: Arc<dyn ShutdownHost>,
        github_api_base: String,
    ) -> Arc<Self> {
        Self::assemble(
            config,
            installers,
            host,
            Fetcher::allowing_http_loopback(),
            github_api_base,
        )
    }

    fn assemble(
        config: ValidatedConfig,
        installers: InstallerRegistry,
        host: Arc<dyn ShutdownHost>,
        fetcher: Fetcher,
        github_api_base: String,
    ) -> Arc<Self> {
        let ledger = InstallLedger::new(config.downloads_dir.clone());
        Arc::new(Self {
            current_version: config.version,
            public_keys: config.public_keys,
            manifest_urls: config.manifests,
            nightly: config.nightly,
            allow_prerelease: config.allow_prerelease,
            auto_install: config.auto_install,
            downloads_dir: config.downloads_dir,
            github_api_base,
            fetcher,
            ledger,
            installers,
            host,
            events: EventBus::new(),
            state: RwLock::new(ControllerState::default()),
            timer: Mutex::new(None),
        })
    }

    /// Subscribe to lifecycle events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// The version this controller considers current.
    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// The downloads directory.
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// The install ledger for this controller's downloads directory.
    pub fn ledger(&self) -> &InstallLedger {
        &self.ledger
    }

    /// Whether a check is in flight.
    pub async fn is_checking(&self) -> bool {
        self.state.read().await.checking
    }

    /// Whether a download is in flight.
    pub async fn is_downloading(&self) -> bool {
        self.state.read().await.downloading
    }

    /// The manifest of the new version found by the last check, if any.
    pub async fn new_version(&self) -> Option<Arc<Manifest>> {
        self.state.read().await.new_version.clone()
    }

    /// Path of the downloaded, verified artifact, if any.
    pub async fn downloaded_file(&self) -> Option<PathBuf> {
        self.state.read().await.downloaded_file.clone()
    }

    /// When the last check started, if one ever did.
    pub async fn last_check_time(&self) -> Option<Instant> {
        self.state.read().await.last_check
    }

    /// Whether the previous run recorded an install attempt that never
    /// advanced the running version.
    pub async fn did_last_update_fail(&self) -> bool {
        self.ledger.did_last_update_fail(&self.current_version.to_string()).await
    }

    /// Remove any leftover update artifact and the install record.
    pub async fn cleanup(&self) {
        self.ledger.cleanup().await;
    }

    /// Run one check cycle.
    ///
    /// Emits `Checking`, then exactly one of `Available`, `NotAvailable`
    /// or `Error`. Manifest sources are tried in order and only the last
    /// failure is surfaced. Finding a newer version starts a download
    /// concurrently unless one is running or an artifact is already on
    /// disk. A call made while a check is in flight is dropped.
    pub async fn check_for_updates(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if state.checking {
                tracing::debug!("update check already in progress, dropping");
                return;
            }
            state.checking = true;
            state.last_check = Some(Instant::now());
        }
        self.events.emit(UpdateEvent::Checking);

        let outcome = self.fetch_first_manifest().await;

        let mut state = self.state.write().await;
        state.checking = false;
        match outcome {
            Err(e) => {
                drop(state);
                tracing::warn!(error = %e, "update check failed");
                self.events.emit(UpdateEvent::Error(Arc::new(e)));
            }
            Ok(Some(manifest)) if manifest.is_newer_version_than(&self.current_version) => {
                tracing::info!(
                    current = %self.current_version,
                    available = %manifest.version(),
                    "update available"
                );
                state.new_version = Some(Arc::clone(&manifest));
                let start_download = !state.downloading && state.downloaded_file.is_none();
                drop(state);
                self.events.emit(UpdateEvent::Available(manifest));
                if start_download {
                    let controller = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = controller.download(None).await;
                    });
                }
            }
            Ok(_) => {
                drop(state);
                tracing::info!(current = %self.current_version, "no update available");
                self.events.emit(UpdateEvent::NotAvailable);
            }
        }
    }

    /// Try each manifest source in order; surface only the last failure.
    async fn fetch_first_manifest(&self) -> Result<Option<Arc<Manifest>>, UpdateError> {
        let mut last_error = None;
        for url in &self.manifest_urls {
            match self.fetch_manifest(url).await {
                Ok(found) => return Ok(found.map(Arc::new)),
                Err(e) => {
                    tracing::warn!(url, error = %e, "manifest source failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            UpdateError::ConfigInvalid("no manifest URLs configured".to_string())
        }))
    }

    /// Fetch and verify a manifest from one source.
    ///
    /// `github:<owner>/<repo>` references resolve through the GitHub
    /// Releases API; anything else is fetched as signed manifest text
    /// directly. Yields `None` when the source has nothing newer.
    async fn fetch_manifest(&self, url: &str) -> Result<Option<Manifest>, UpdateError> {
        if let Some(reference) = url.strip_prefix("github:") {
            return self.fetch_github_manifest(reference).await;
        }
        let text = self.fetcher.fetch_text(url, None).await?;
        Manifest::load_from_string(&self.public_keys, &text).map(Some)
    }

    async fn fetch_github_manifest(
        &self,
        reference: &str,
    ) -> Result<Option<Manifest>, UpdateError> {
        let (owner, repo) = parse_github_reference(reference)?;

        let releases = if self.allow_prerelease {
            self.fetcher
                .fetch_json_pages(&format!(
                    "{}/repos/{owner}/{repo}/releases",
                    self.github_api_base
                ))
                .await?
        } else {
            vec![
                self.fetcher
                    .fetch_json(&format!(
                        "{}/repos/{owner}/{repo}/releases/latest",
                        self.github_api_base
                    ))
                    .await?,
            ]
        };

        let mut best: Option<(Version, &serde_json::Value)> = None;
        for release in &releases {
            let Some(tag) = release.get("tag_name").and_then(|t| t.as_str()) else {
                continue;
            };
            let Ok(version) = Version::parse(tag.trim_start_matches('v')) else {
                tracing::debug!(tag, "skipping release with non-semver tag");
                continue;
            };
            if best.as_ref().map_or(true, |(b, _)| version > *b) {
                best = Some((version, release));
            }
        }

        let Some((version, release)) = best else {
            tracing::debug!(owner, repo, "no usable releases");
            return Ok(None);
        };
        if version <= self.current_version {
            tracing::debug!(%version, "latest release is not newer");
            return Ok(None);
        }

        let asset_url = release
            .get("assets")
            .and_then(|a| a.as_array())
            .and_then(|assets| {
                assets.iter().find(|asset| {
                    asset.get("name").and_then(|n| n.as_str()) == Some(GITHUB_MANIFEST_ASSET)
                })
            })
            .and_then(|asset| asset.get("browser_download_url"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                UpdateError::BadManifest(format!(
                    "release {version} has no {GITHUB_MANIFEST_ASSET} asset"
                ))
            })?;

        let text = self.fetcher.fetch_text(asset_url, None).await?;
        Manifest::load_from_string(&self.public_keys, &text).map(Some)
    }

    /// Download and verify the artifact for `platform` (host platform when
    /// `None`).
    ///
    /// Requires a prior check to have found a new version. Exactly one
    /// file lands in the downloads directory per successful call; failed
    /// calls leave no partial artifact behind. Emits `Downloaded` or
    /// `Error`; the returned error is the same value the event carries.
    pub async fn download(
        self: &Arc<Self>,
        platform: Option<&str>,
    ) -> Result<PathBuf, Arc<UpdateError>> {
        match self.download_impl(platform).await {
            Ok(path) => Ok(path),
            Err(UpdateError::DownloadInProgress) => {
                Err(Arc::new(UpdateError::DownloadInProgress))
            }
            Err(e) => {
                let e = Arc::new(e);
                self.events.emit(UpdateEvent::Error(Arc::clone(&e)));
                Err(e)
            }
        }
    }

    async fn download_impl(self: &Arc<Self>, platform: Option<&str>) -> Result<PathBuf, UpdateError> {
        let manifest = self
            .state
            .read()
            .await
            .new_version
            .clone()
            .ok_or(UpdateError::NoUpdate)?;

        let platform = match platform {
            Some(p) => p.to_string(),
            None => platform::manifest_platform()?.to_string(),
        };
        let (file_url, size, hash) = manifest.platform_file(&platform)?;

        {
            let mut state = self.state.write().await;
            if state.downloading {
                return Err(UpdateError::DownloadInProgress);
            }
            state.downloading = true;
        }
        tracing::info!(version = %manifest.version(), platform, url = %file_url, "downloading update");

        let result = self.download_and_verify(&file_url, size, &hash).await;

        let mut state = self.state.write().await;
        state.downloading = false;
        let path = match result {
            Ok(path) => path,
            Err(e) => {
                drop(state);
                return Err(e);
            }
        };
        state.downloaded_file = Some(path.clone());
        drop(state);

        if self.auto_install {
            self.arm_exit_hook().await;
        }
        self.events.emit(UpdateEvent::Downloaded(path.clone(), manifest));
        Ok(path)
    }

    async fn download_and_verify(
        &self,
        url: &str,
        size: u64,
        hash: &str,
    ) -> Result<PathBuf, UpdateError> {
        tokio::fs::create_dir_all(&self.downloads_dir).await?;

        let mut random = [0u8; TMP_RANDOM_BYTES];
        OsRng.fill_bytes(&mut random);
        let path = self
            .downloads_dir
            .join(format!("{TMP_PREFIX}{}{TMP_SUFFIX}", hex::encode(random)));

        let result: Result<PathBuf, UpdateError> = async {
            self.fetcher.fetch_file(url, &path).await?;
            artifact::verify_size(size, &path).await?;
            artifact::verify_hash(hash, &path).await?;
            Ok(path.clone())
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "could not remove failed download");
                }
            }
        }
        result
    }

    /// Start recurring checks. The interval is clamped to at least
    /// [`MIN_CHECK_INTERVAL`] and defaults to [`DEFAULT_CHECK_INTERVAL`].
    /// Ticks that fire while a check is already running are dropped.
    pub async fn check_periodically(self: &Arc<Self>, interval: Option<Duration>) {
        let interval = effective_interval(interval);
        tracing::info!(?interval, "scheduling periodic update checks");

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.check_for_updates().await;
            }
        });

        if let Some(previous) = self.timer.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the periodic timer. In-flight fetches are unaffected; they
    /// end only through their own timeouts.
    pub async fn stop_checking_periodically(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            tracing::debug!("periodic update checks stopped");
        }
    }

    /// Record the pending install and arm the install-on-quit hook,
    /// without restarting after installation.
    pub async fn schedule_install_on_quit(self: &Arc<Self>) {
        self.state.write().await.restart = false;
        self.persist_install_attempt().await;
        self.arm_exit_hook().await;
    }

    /// Record the pending install, arm the hook, and ask the host to quit
    /// now; the application restarts after installation.
    pub async fn quit_and_install(self: &Arc<Self>) {
        self.state.write().await.restart = true;
        self.persist_install_attempt().await;
        self.arm_exit_hook().await;

        if cfg!(target_os = "linux") {
            if let Some(exe) = self.host.relaunch_executable() {
                self.host.set_relaunch_path(exe);
            }
        }
        self.host.request_quit();
    }

    /// Retry a previously failed install.
    ///
    /// With `allow_local`, a recorded artifact that still verifies
    /// against the ledger is re-used; otherwise the update is re-checked
    /// and re-downloaded. Ends in [`quit_and_install`](Self::quit_and_install).
    /// On failure another attempt is recorded and the host is asked to
    /// relaunch.
    pub async fn quit_and_retry_install(
        self: &Arc<Self>,
        allow_local: bool,
    ) -> Result<(), Arc<UpdateError>> {
        match self.retry_install_impl(allow_local).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "update retry failed");
                let e = Arc::new(e);
                self.events.emit(UpdateEvent::Error(Arc::clone(&e)));
                self.persist_install_attempt().await;
                self.host.request_relaunch();
                Err(e)
            }
        }
    }

    async fn retry_install_impl(self: &Arc<Self>, allow_local: bool) -> Result<(), UpdateError> {
        let mut reused = false;

        if allow_local {
            if let Ok(Some(info)) = self.ledger.load().await {
                match self.ledger.valid_update_file(&info).await {
                    Ok(path) => {
                        tracing::info!(path = %path.display(), "re-using downloaded update");
                        self.state.write().await.downloaded_file = Some(path);
                        reused = true;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "recorded update file is not usable");
                    }
                }
            }
        }

        if !reused {
            let manifest = self
                .fetch_first_manifest()
                .await?
                .filter(|m| m.is_newer_version_than(&self.current_version))
                .ok_or(UpdateError::NoUpdate)?;
            {
                let mut state = self.state.write().await;
                state.new_version = Some(manifest);
                state.downloaded_file = None;
            }
            self.download_impl(None).await?;
        }

        self.quit_and_install().await;
        Ok(())
    }

    /// Write the install attempt record. Errors are logged, never fatal.
    async fn persist_install_attempt(&self) {
        let (manifest, file) = {
            let state = self.state.read().await;
            (state.new_version.clone(), state.downloaded_file.clone())
        };
        let Some(file) = file else {
            tracing::warn!("no downloaded update to record");
            return;
        };

        let previous = self.ledger.load().await.ok().flatten();
        let attempts = previous.as_ref().map(|p| p.attempts).unwrap_or(0) + 1;

        let info = match (manifest, previous) {
            (Some(manifest), _) => {
                let platform = match platform::manifest_platform() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot record install attempt");
                        return;
                    }
                };
                let Ok((_, size, hash)) = manifest.platform_file(platform) else {
                    tracing::warn!(platform, "manifest has no platform entry to record");
                    return;
                };
                UpdateInfo {
                    attempts,
                    current_version: self.current_version.to_string(),
                    update_version: manifest.version().to_string(),
                    update_size: size,
                    update_hash: hash,
                    update_file: file,
                }
            }
            (None, Some(previous)) => UpdateInfo {
                attempts,
                update_file: file,
                ..previous
            },
            (None, None) => {
                tracing::warn!("no manifest or prior record to describe the install");
                return;
            }
        };

        if let Err(e) = self.ledger.record(&info).await {
            tracing::warn!(error = %e, "could not persist update info (continuing)");
        }
    }

    /// Install the before-quit hook, once.
    async fn arm_exit_hook(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if state.exit_hook_armed {
                return;
            }
            state.exit_hook_armed = true;
        }
        tracing::debug!("arming install-on-quit hook");

        let controller = Arc::clone(self);
        self.host.on_shutdown(Box::new(move || {
            Box::pin(async move {
                controller.run_pending_install().await;
            })
        }));
    }

    /// Hand the downloaded artifact to the platform installer. Invoked by
    /// the host's before-quit signal through the armed hook.
    pub async fn run_pending_install(self: &Arc<Self>) {
        let (file, restart) = {
            let state = self.state.read().await;
            (state.downloaded_file.clone(), state.restart)
        };
        let Some(file) = file else {
            tracing::warn!("install hook fired without a downloaded update");
            return;
        };

        let installer = match self.installers.select_host(self.nightly) {
            Ok(installer) => installer,
            Err(e) => {
                tracing::error!(error = %e, nightly = self.nightly, "no installer for this platform");
                return;
            }
        };

        tracing::info!(
            installer = %installer.description(),
            artifact = %file.display(),
            restart,
            "handing artifact to installer"
        );
        if let Err(e) = installer.install(&file, restart).await {
            tracing::error!(error = %e, "installer failed");
        }
    }
}

/// Clamp a requested periodic interval to policy.
pub(crate) fn effective_interval(interval: Option<Duration>) -> Duration {
    interval.unwrap_or(DEFAULT_CHECK_INTERVAL).max(MIN_CHECK_INTERVAL)
}

/// Split and sanity-check a `github:<owner>/<repo>` reference.
///
/// Owner and repository may only contain characters that cannot change
/// the meaning of the API URL they are spliced into.
fn parse_github_reference(reference: &str) -> Result<(&str, &str), UpdateError> {
    let (owner, repo) = reference.split_once('/').ok_or_else(|| {
        UpdateError::ConfigInvalid(format!("github reference {reference:?} must be owner/repo"))
    })?;
    for part in [owner, repo] {
        let safe = !part.is_empty()
            && part.len() <= 100
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !part.starts_with('.')
            && !part.contains("..");
        if !safe {
            return Err(UpdateError::ConfigInvalid(format!(
                "unsafe github repository identifier {part:?}"
            )));
        }
    }
    Ok((owner, repo))
}
