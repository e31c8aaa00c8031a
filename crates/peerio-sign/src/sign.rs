//! `peerio-sign sign` — sign an unsigned manifest body.

use std::path::Path;

use anyhow::Context;
use peerio_updater::manifest::{parse_data, Manifest};
use peerio_updater::signify::{self, SecretKey};

pub fn run(body_path: &Path, key_path: &Path, output: &Path) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(body_path)
        .with_context(|| format!("cannot read {}", body_path.display()))?;
    let secret = SecretKey::from_base64(&signify::read_key_file(key_path)?)
        .with_context(|| format!("bad secret key in {}", key_path.display()))?;

    let manifest = Manifest::from_data(parse_data(&body))
        .with_context(|| format!("{} is not a valid manifest body", body_path.display()))?;
    let text = manifest.serialize(&secret)?;
    std::fs::write(output, &text)
        .with_context(|| format!("cannot write {}", output.display()))?;

    println!(
        "Signed manifest for {} written to {}",
        manifest.version(),
        output.display()
    );
    Ok(())
}
