//! `peerio-sign keygen` — generate a manifest signing keypair.

use std::path::Path;

use peerio_updater::signify;

pub fn run(output_dir: &Path, name: &str) -> anyhow::Result<()> {
    let public_path = output_dir.join(format!("{name}.pub"));
    let secret_path = output_dir.join(format!("{name}.sec"));

    for path in [&public_path, &secret_path] {
        if path.exists() {
            anyhow::bail!(
                "{} already exists; remove it first or pick another --name",
                path.display()
            );
        }
    }

    let (public, secret) = signify::generate_keypair();
    signify::write_key_file(&public_path, &format!("{name} public key"), &public.to_base64(), false)?;
    signify::write_key_file(&secret_path, &format!("{name} secret key"), &secret.to_base64(), true)?;

    println!("Generated signify keypair");
    println!("  Secret key: {}", secret_path.display());
    println!("  Public key: {}", public_path.display());
    println!();
    println!("  Embed this public key in the application configuration:");
    println!("    {}", public.to_base64());
    println!();
    println!("  Keep the secret key offline. Anyone holding it can sign updates.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_both_key_files() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), "test-key").unwrap();

        assert!(dir.path().join("test-key.pub").exists());
        assert!(dir.path().join("test-key.sec").exists());

        let public_b64 = signify::read_key_file(&dir.path().join("test-key.pub")).unwrap();
        peerio_updater::PublicKey::from_base64(&public_b64).unwrap();
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), "test-key").unwrap();
        assert!(run(dir.path(), "test-key").is_err());
    }
}
