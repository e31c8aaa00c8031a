//! Signed update manifests.
//!
//! A manifest is a short signed text file describing one release:
//!
//! ```text
//! untrusted comment: Peerio Updater manifest
//! <base64 signify signature>
//!
//! version: 1.2.3
//! urgency: optional since 1.2.0
//! date: 2024-05-01T12:00:00Z
//! changelog: https://example.com/changelog
//!
//! mac-file: https://example.com/app-1.2.3.dmg
//! mac-sha512: <hex>
//! mac-size: 48213992
//! ```
//!
//! The signature covers everything from the third line to end of input,
//! byte for byte; parsing happens only after the signature verifies.
//! Parsed manifests are immutable. [`serialize`](Manifest::serialize)
//! regenerates the flat representation deterministically, so anything a
//! manifest was loaded from can be reproduced and re-signed.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use semver::Version;

use crate::error::UpdateError;
use crate::signify::{self, PublicKey, SecretKey};

/// Comment line used when serializing a manifest.
const UNTRUSTED_COMMENT: &str = "untrusted comment: Peerio Updater manifest";

/// Header keys emitted first, in this order.
const HEADER_KEYS: [&str; 4] = ["version", "urgency", "date", "changelog"];

/// An immutable, signature-verified update manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    version: Version,
    data: BTreeMap<String, String>,
}

impl Manifest {
    /// Verify and parse a manifest from its signed text form.
    ///
    /// The first line is an untrusted comment, the second the base64
    /// signature, and everything after the second newline is the signed
    /// body. Signature verification runs over the body bytes unchanged;
    /// only then are the `key: value` lines interpreted.
    pub fn load_from_string(keys: &[PublicKey], text: &str) -> Result<Self, UpdateError> {
        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() < 3 {
            return Err(UpdateError::BadManifest(
                "expected an untrusted comment, a signature and a body".to_string(),
            ));
        }

        let signature = lines[1].trim();
        let body = lines[2..].join("\n");
        signify::verify(keys, signature, &body)?;

        let manifest = Self::from_data(parse_data(&body))?;
        tracing::debug!(version = %manifest.version, "manifest verified and parsed");
        Ok(manifest)
    }

    /// Build a manifest from a raw key/value map, validating the version.
    pub fn from_data(data: BTreeMap<String, String>) -> Result<Self, UpdateError> {
        let raw = data
            .get("version")
            .ok_or_else(|| UpdateError::InvalidVersion("<missing>".to_string()))?;
        let version =
            Version::parse(raw).map_err(|_| UpdateError::InvalidVersion(raw.clone()))?;
        Ok(Self { version, data })
    }

    /// The release version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// True when this manifest describes a version newer than `current`.
    pub fn is_newer_version_than(&self, current: &Version) -> bool {
        self.version > *current
    }

    /// The urgency value; absent means `mandatory`.
    pub fn urgency(&self) -> &str {
        self.data.get("urgency").map(String::as_str).unwrap_or("mandatory")
    }

    /// The version since which this update is optional, if the urgency is
    /// a well-formed `optional since <semver>`.
    pub fn optional_since(&self) -> Option<Version> {
        let rest = self.urgency().strip_prefix("optional since ")?;
        Version::parse(rest.trim()).ok()
    }

    /// Whether a client running `current` must treat this update as
    /// mandatory. Malformed urgency values degrade to mandatory.
    pub fn is_mandatory_since(&self, current: &Version) -> bool {
        if self.urgency() == "mandatory" {
            return true;
        }
        match self.optional_since() {
            None => true,
            Some(since) => *current < since,
        }
    }

    /// Release date, when present and RFC 3339.
    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.data.get("date").and_then(|d| DateTime::parse_from_rfc3339(d).ok())
    }

    /// Changelog URL, when present.
    pub fn changelog(&self) -> Option<&str> {
        self.data.get("changelog").map(String::as_str)
    }

    /// Artifact address for a platform (`<platform>-file`).
    pub fn file(&self, platform: &str) -> Option<&str> {
        self.data.get(&format!("{platform}-file")).map(String::as_str)
    }

    /// Artifact size in bytes for a platform (`<platform>-size`).
    pub fn size(&self, platform: &str) -> Option<u64> {
        self.data.get(&format!("{platform}-size")).and_then(|s| s.parse().ok())
    }

    /// Artifact SHA-512 hex for a platform (`<platform>-sha512`).
    pub fn sha512(&self, platform: &str) -> Option<&str> {
        self.data.get(&format!("{platform}-sha512")).map(String::as_str)
    }

    /// The complete file/size/sha512 triple for a platform, or
    /// [`UpdateError::NoPlatformFile`] if any part is missing.
    pub fn platform_file(&self, platform: &str) -> Result<(String, u64, String), UpdateError> {
        match (self.file(platform), self.size(platform), self.sha512(platform)) {
            (Some(file), Some(size), Some(hash)) => {
                Ok((file.to_string(), size, hash.to_string()))
            }
            _ => Err(UpdateError::NoPlatformFile {
                platform: platform.to_string(),
            }),
        }
    }

    /// The raw key/value data.
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Serialize and sign, producing the wire text form.
    ///
    /// Header keys come first in a fixed order; the remaining keys follow
    /// sorted, with a blank line whenever the prefix before the first `-`
    /// changes, which groups each platform's entries together. Loading the
    /// result recovers identical key/value data.
    pub fn serialize(&self, secret: &SecretKey) -> Result<String, UpdateError> {
        let body = self.serialize_body();
        let signature = signify::sign(secret, &body)?;
        Ok(format!("{UNTRUSTED_COMMENT}\n{signature}\n{body}"))
    }

    fn serialize_body(&self) -> String {
        let mut out = String::from("\n");

        for key in HEADER_KEYS {
            if let Some(value) = self.data.get(key) {
                out.push_str(&format!("{key}: {value}\n"));
            }
        }

        let mut last_prefix: Option<&str> = None;
        for (key, value) in &self.data {
            if HEADER_KEYS.contains(&key.as_str()) {
                continue;
            }
            let prefix = key.split('-').next().unwrap_or(key.as_str());
            if last_prefix != Some(prefix) {
                out.push('\n');
                last_prefix = Some(prefix);
            }
            out.push_str(&format!("{key}: {value}\n"));
        }

        out.push('\n');
        out
    }
}

/// Parse manifest body lines into a key/value map.
///
/// Lines are trimmed and empty lines dropped. The separator is the first
/// `:`; a line without one maps the whole line to the empty string.
pub fn parse_data(body: &str) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for line in body.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => {
                data.insert(key.trim_end().to_string(), value.trim().to_string())
            }
            None => data.insert(line.to_string(), String::new()),
        };
    }
    data
}

/// Builder for manifests on the release side.
///
/// Used by signing tooling to assemble a manifest and compute platform
/// entry sizes and hashes from artifact files on disk.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    data: BTreeMap<String, String>,
}

impl ManifestBuilder {
    /// Start a manifest for `version`.
    pub fn new(version: &Version) -> Self {
        let mut data = BTreeMap::new();
        data.insert("version".to_string(), version.to_string());
        Self { data }
    }

    /// Mark the update as mandatory for everyone.
    pub fn mandatory(mut self) -> Self {
        self.data.insert("urgency".to_string(), "mandatory".to_string());
        self
    }

    /// Mark the update as optional for clients at or above `since`.
    pub fn optional_since(mut self, since: &Version) -> Self {
        self.data.insert("urgency".to_string(), format!("optional since {since}"));
        self
    }

    /// Set the release date.
    pub fn date(mut self, when: DateTime<chrono::Utc>) -> Self {
        self.data.insert(
            "date".to_string(),
            when.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        self
    }

    /// Set the changelog URL.
    pub fn changelog(mut self, url: &str) -> Self {
        self.data.insert("changelog".to_string(), url.to_string());
        self
    }

    /// Insert an arbitrary key/value entry.
    pub fn entry(mut self, key: &str, value: &str) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a platform triple with explicit size and hash.
    pub fn platform_entry(mut self, platform: &str, file: &str, size: u64, sha512: &str) -> Self {
        self.data.insert(format!("{platform}-file"), file.to_string());
        self.data.insert(format!("{platform}-size"), size.to_string());
        self.data.insert(format!("{platform}-sha512"), sha512.to_string());
        self
    }

    /// Add a platform triple, computing size and SHA-512 from an artifact
    /// file on disk. `file` is the address clients will download.
    pub async fn platform_artifact(
        self,
        platform: &str,
        file: &str,
        artifact: &std::path::Path,
    ) -> Result<Self, UpdateError> {
        let size = tokio::fs::metadata(artifact).await?.len();
        let sha512 = crate::artifact::compute_sha512(artifact).await?;
        Ok(self.platform_entry(platform, file, size, &sha512))
    }

    /// Validate and build the manifest.
    pub fn build(self) -> Result<Manifest, UpdateError> {
        Manifest::from_data(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signify::generate_keypair;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn sample_manifest() -> Manifest {
        ManifestBuilder::new(&version("1.2.3"))
            .optional_since(&version("1.2.0"))
            .changelog("https://example.com/changelog")
            .entry("date", "2024-05-01T12:00:00Z")
            .platform_entry("mac", "https://example.com/app.dmg", 1024, "ab".repeat(64).as_str())
            .platform_entry("linux-x64", "https://example.com/app.AppImage", 2048, "cd".repeat(64).as_str())
            .build()
            .unwrap()
    }

    #[test]
    fn serialize_load_roundtrip_preserves_data() {
        let (public, secret) = generate_keypair();
        let manifest = sample_manifest();

        let text = manifest.serialize(&secret).unwrap();
        let loaded = Manifest::load_from_string(&[public], &text).unwrap();

        assert_eq!(loaded.data(), manifest.data());
        assert_eq!(loaded.version(), manifest.version());
    }

    #[test]
    fn serialized_body_layout_is_deterministic() {
        let manifest = sample_manifest();
        let body = manifest.serialize_body();

        let expected = format!(
            "\nversion: 1.2.3\nurgency: optional since 1.2.0\n\
             date: 2024-05-01T12:00:00Z\nchangelog: https://example.com/changelog\n\
             \nlinux-x64-file: https://example.com/app.AppImage\n\
             linux-x64-sha512: {}\nlinux-x64-size: 2048\n\
             \nmac-file: https://example.com/app.dmg\n\
             mac-sha512: {}\nmac-size: 1024\n\n",
            "cd".repeat(64),
            "ab".repeat(64),
        );
        assert_eq!(body, expected);
    }

    #[test]
    fn tampering_with_version_fails_signature_not_version() {
        let (public, secret) = generate_keypair();
        let text = sample_manifest().serialize(&secret).unwrap();

        let tampered = text.replace("version: 1.2.3", "version: 1.2.4");
        assert_ne!(tampered, text);

        let err = Manifest::load_from_string(&[public], &tampered).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidSignature));
    }

    #[test]
    fn tampering_with_any_body_byte_fails() {
        let (public, secret) = generate_keypair();
        let text = sample_manifest().serialize(&secret).unwrap();

        // Flip a byte inside a platform hash, well past the header.
        let idx = text.find("mac-sha512").unwrap() + 15;
        let mut bytes = text.into_bytes();
        bytes[idx] ^= 0x20;
        let tampered = String::from_utf8(bytes).unwrap();

        let err = Manifest::load_from_string(&[public], &tampered).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidSignature));
    }

    #[test]
    fn too_few_lines_is_bad_manifest() {
        let (public, _) = generate_keypair();
        let err = Manifest::load_from_string(&[public], "untrusted comment: x\nsig").unwrap_err();
        assert!(matches!(err, UpdateError::BadManifest(_)));
    }

    #[test]
    fn missing_version_is_invalid_version() {
        let (public, secret) = generate_keypair();
        let manifest = Manifest {
            version: version("0.0.0"),
            data: [("urgency".to_string(), "mandatory".to_string())].into_iter().collect(),
        };
        let text = manifest.serialize(&secret).unwrap();

        let err = Manifest::load_from_string(&[public], &text).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidVersion(_)));
    }

    #[test]
    fn version_comparisons() {
        let manifest = sample_manifest();
        assert!(manifest.is_newer_version_than(&version("1.2.0")));
        assert!(!manifest.is_newer_version_than(&version("1.2.3")));
        assert!(!manifest.is_newer_version_than(&version("1.2.4")));
    }

    #[test]
    fn urgency_defaults_to_mandatory() {
        let manifest = ManifestBuilder::new(&version("2.0.0")).build().unwrap();
        assert_eq!(manifest.urgency(), "mandatory");
        assert_eq!(manifest.optional_since(), None);
        assert!(manifest.is_mandatory_since(&version("1.9.9")));
    }

    #[test]
    fn optional_since_semantics() {
        let manifest = sample_manifest(); // optional since 1.2.0
        assert_eq!(manifest.optional_since(), Some(version("1.2.0")));

        // Older clients must update; clients at or past the threshold may defer.
        assert!(manifest.is_mandatory_since(&version("1.1.9")));
        assert!(!manifest.is_mandatory_since(&version("1.2.0")));
        assert!(!manifest.is_mandatory_since(&version("1.2.2")));
    }

    #[test]
    fn malformed_optional_since_degrades_to_mandatory() {
        let manifest = ManifestBuilder::new(&version("2.0.0"))
            .entry("urgency", "optional since soon")
            .build()
            .unwrap();
        assert_eq!(manifest.optional_since(), None);
        assert!(manifest.is_mandatory_since(&version("1.9.9")));
    }

    #[test]
    fn parse_data_handles_colonless_and_blank_lines() {
        let data = parse_data("\n  version: 1.0.0  \n\nflagged\nkey:  spaced value \n");
        assert_eq!(data.get("version").unwrap(), "1.0.0");
        assert_eq!(data.get("flagged").unwrap(), "");
        assert_eq!(data.get("key").unwrap(), "spaced value");
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn value_keeps_everything_after_first_colon() {
        let data = parse_data("changelog: https://example.com/notes\n");
        assert_eq!(data.get("changelog").unwrap(), "https://example.com/notes");
    }

    #[test]
    fn platform_accessors() {
        let manifest = sample_manifest();
        assert_eq!(manifest.file("mac").unwrap(), "https://example.com/app.dmg");
        assert_eq!(manifest.size("mac").unwrap(), 1024);
        assert_eq!(manifest.sha512("mac").unwrap(), "ab".repeat(64));
        assert!(manifest.file("windows").is_none());

        let (file, size, hash) = manifest.platform_file("linux-x64").unwrap();
        assert_eq!(file, "https://example.com/app.AppImage");
        assert_eq!(size, 2048);
        assert_eq!(hash, "cd".repeat(64));

        let err = manifest.platform_file("windows").unwrap_err();
        assert!(matches!(err, UpdateError::NoPlatformFile { platform } if platform == "windows"));
    }

    #[test]
    fn non_semver_size_is_none() {
        let manifest = ManifestBuilder::new(&version("1.0.0"))
            .entry("mac-size", "lots")
            .build()
            .unwrap();
        assert_eq!(manifest.size("mac"), None);
    }

    #[test]
    fn garbage_signature_line_propagates_signer_error() {
        let (public, _) = generate_keypair();
        let err = Manifest::load_from_string(
            &[public],
            "untrusted comment: x\n!!not base64!!\nversion: 1.0.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, UpdateError::Base64(_)));
    }

    #[test]
    fn wrong_key_fails_with_no_matching_key() {
        let (_, secret) = generate_keypair();
        let (other_public, _) = generate_keypair();
        let text = sample_manifest().serialize(&secret).unwrap();

        let err = Manifest::load_from_string(&[other_public], &text).unwrap_err();
        assert!(matches!(err, UpdateError::NoMatchingKey));
    }

    #[tokio::test]
    async fn builder_computes_artifact_size_and_hash() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"installer payload").unwrap();
        file.flush().unwrap();

        let manifest = ManifestBuilder::new(&version("1.0.0"))
            .platform_artifact("mac", "https://example.com/app.dmg", file.path())
            .await
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(manifest.size("mac").unwrap(), 17);
        assert_eq!(
            manifest.sha512("mac").unwrap(),
            crate::artifact::compute_sha512(file.path()).await.unwrap()
        );
    }
}
