//! `peerio-sign verify` — verify a signed manifest and describe it.

use std::path::Path;

use anyhow::Context;
use peerio_updater::signify::{self, PublicKey};
use peerio_updater::Manifest;

pub fn run(manifest_path: &Path, key: &str) -> anyhow::Result<()> {
    let key_b64 = if Path::new(key).exists() {
        signify::read_key_file(Path::new(key))?
    } else {
        key.to_string()
    };
    let public = PublicKey::from_base64(&key_b64).context("bad public key")?;

    let text = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("cannot read {}", manifest_path.display()))?;
    let manifest = Manifest::load_from_string(&[public], &text)
        .context("manifest did not verify")?;

    println!("Signature OK");
    println!("  version:  {}", manifest.version());
    println!("  urgency:  {}", manifest.urgency());
    if let Some(changelog) = manifest.changelog() {
        println!("  changelog: {changelog}");
    }
    for (key, _) in manifest.data() {
        if let Some(platform) = key.strip_suffix("-file") {
            let size = manifest.size(platform).unwrap_or(0);
            println!("  platform: {platform} ({size} bytes)");
        }
    }

    Ok(())
}
