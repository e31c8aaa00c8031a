//! `peerio-sign new-manifest` — assemble and sign a release manifest.

use std::path::Path;

use anyhow::Context;
use peerio_updater::signify::{self, SecretKey};
use peerio_updater::ManifestBuilder;
use semver::Version;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    version: &Version,
    key_path: &Path,
    output: &Path,
    optional_since: Option<&Version>,
    changelog: Option<&str>,
    url_prefix: Option<&str>,
    artifacts: &[String],
) -> anyhow::Result<()> {
    if artifacts.is_empty() {
        anyhow::bail!("at least one --artifact <platform>=<path> is required");
    }

    let secret = SecretKey::from_base64(&signify::read_key_file(key_path)?)
        .with_context(|| format!("bad secret key in {}", key_path.display()))?;

    let mut builder = ManifestBuilder::new(version).date(chrono::Utc::now());
    builder = match optional_since {
        Some(since) => builder.optional_since(since),
        None => builder.mandatory(),
    };
    if let Some(url) = changelog {
        builder = builder.changelog(url);
    }

    for entry in artifacts {
        let (platform, path) = entry
            .split_once('=')
            .with_context(|| format!("artifact {entry:?} is not <platform>=<path>"))?;
        let path = Path::new(path);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact path {} has no file name", path.display()))?;
        let address = match url_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), file_name),
            None => file_name.to_string(),
        };

        builder = builder
            .platform_artifact(platform, &address, path)
            .await
            .with_context(|| format!("cannot read artifact {}", path.display()))?;
    }

    let manifest = builder.build()?;
    let text = manifest.serialize(&secret)?;
    std::fs::write(output, &text)
        .with_context(|| format!("cannot write {}", output.display()))?;

    println!("Wrote signed manifest for {} to {}", version, output.display());
    Ok(())
}
