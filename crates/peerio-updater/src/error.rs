//! Error types for the update pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur anywhere in the update pipeline.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The startup configuration is unusable
    #[error("invalid updater configuration: {0}")]
    ConfigInvalid(String),

    /// A decoded key or signature has the wrong length
    #[error("bad {what} length: expected {expected} bytes, got {actual}")]
    BadLength {
        /// What was being decoded ("public key", "secret key", "signature")
        what: &'static str,
        /// Expected decoded length in bytes
        expected: usize,
        /// Actual decoded length in bytes
        actual: usize,
    },

    /// The two-byte algorithm tag is not `Ed`
    #[error("unknown signature algorithm")]
    UnknownAlgorithm,

    /// The secret key uses KDF parameters other than the unencrypted form
    #[error("unsupported KDF parameters in secret key (only unencrypted keys are accepted)")]
    UnsupportedKdf,

    /// The secret key checksum does not match the embedded key material
    #[error("secret key checksum mismatch")]
    ChecksumMismatch,

    /// No configured public key matches the signature's key number
    #[error("signature does not match any configured public key")]
    NoMatchingKey,

    /// Ed25519 verification failed
    #[error("signature verification failed")]
    InvalidSignature,

    /// The manifest text does not have the expected shape
    #[error("malformed manifest: {0}")]
    BadManifest(String),

    /// The manifest `version` value is missing or not valid semver
    #[error("manifest version is missing or not valid semver: {0}")]
    InvalidVersion(String),

    /// The host OS/architecture has no manifest platform tag
    #[error("unsupported platform: {os}-{arch}")]
    UnsupportedPlatform {
        /// Host operating system
        os: &'static str,
        /// Host architecture
        arch: &'static str,
    },

    /// The server answered 404
    #[error("resource not found: {url}")]
    NotFound {
        /// URL that returned 404
        url: String,
    },

    /// The redirect chain exceeded the redirect cap
    #[error("too many redirects while fetching {url}")]
    TooManyRedirects {
        /// URL of the original request
        url: String,
    },

    /// A request or redirect would leave https
    #[error("refusing non-https URL: {url}")]
    UnsafeRedirect {
        /// The offending URL
        url: String,
    },

    /// The response `Content-Type` does not match what the caller required
    #[error("unexpected content type: expected {expected}, got {actual}")]
    UnexpectedContentType {
        /// Content type the caller required
        expected: String,
        /// Content type the server sent
        actual: String,
    },

    /// A text response grew past the text sink budget
    #[error("response exceeds {limit} UTF-16 code units")]
    ResponseTooLarge {
        /// The configured budget
        limit: usize,
    },

    /// Transport-level failure after retries were exhausted
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The request idled past the socket timeout
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// `download` was called with no new version known
    #[error("no update available to download")]
    NoUpdate,

    /// The manifest has no complete file/size/sha512 triple for the platform
    #[error("manifest has no update file for platform {platform}")]
    NoPlatformFile {
        /// The platform tag that was looked up
        platform: String,
    },

    /// The downloaded artifact hashes to something else
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash the manifest promised (lowercase hex)
        expected: String,
        /// Hash the file actually has (lowercase hex)
        actual: String,
    },

    /// The downloaded artifact has the wrong size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size the manifest promised
        expected: u64,
        /// Size the file actually has
        actual: u64,
    },

    /// A second download was requested while one is in flight
    #[error("a download is already in progress")]
    DownloadInProgress,

    /// The persisted update-info ledger cannot be used
    #[error("update info file is invalid: {0}")]
    UpdateInfoInvalid(String),

    /// No installer is registered for this host OS / nightly combination
    #[error("no installer registered for this platform")]
    UnknownPlatformInstaller,

    /// Base64 decoding failed
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Semver parse error
    #[error("version parse error: {0}")]
    Semver(#[from] semver::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpdateError::RequestTimeout(crate::fetch::REQUEST_TIMEOUT)
        } else {
            UpdateError::RequestFailed(err.to_string())
        }
    }
}
