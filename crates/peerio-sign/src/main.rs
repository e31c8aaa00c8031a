//! `peerio-sign` — release-side tooling for peerio-updater.
//!
//! Generates signify keypairs and builds, signs and verifies update
//! manifests. This is the producer of everything the in-app updater
//! consumes.

mod keygen;
mod new_manifest;
mod sign;
mod verify;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "peerio-sign", version, about = "Update manifest signing tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new signify keypair for manifest signing.
    Keygen {
        /// Directory to write the key files into.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Base name for the key files (<name>.pub / <name>.sec).
        #[arg(long, default_value = "peerio-update")]
        name: String,
    },

    /// Build and sign a manifest from release artifacts.
    NewManifest {
        /// Release version (semver).
        #[arg(long)]
        version: semver::Version,
        /// Secret key file produced by `keygen`.
        #[arg(long)]
        key: PathBuf,
        /// Output manifest file.
        #[arg(long, default_value = "manifest.txt")]
        output: PathBuf,
        /// Mark the release optional for clients at or above this version.
        #[arg(long)]
        optional_since: Option<semver::Version>,
        /// Changelog URL.
        #[arg(long)]
        changelog: Option<String>,
        /// URL prefix the artifacts will be served under.
        #[arg(long)]
        url_prefix: Option<String>,
        /// Platform artifact as `<platform>=<path>`, repeatable
        /// (e.g. `mac=dist/app.dmg`).
        #[arg(long = "artifact", value_name = "PLATFORM=PATH")]
        artifacts: Vec<String>,
    },

    /// Sign an unsigned `key: value` manifest body file.
    Sign {
        /// Unsigned manifest body.
        body: PathBuf,
        /// Secret key file produced by `keygen`.
        #[arg(long)]
        key: PathBuf,
        /// Output manifest file.
        #[arg(long, default_value = "manifest.txt")]
        output: PathBuf,
    },

    /// Verify a signed manifest and print what it declares.
    Verify {
        /// Signed manifest file.
        manifest: PathBuf,
        /// Public key: a base64 string or a path to a `.pub` file.
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match Cli::parse().command {
        Command::Keygen { output_dir, name } => keygen::run(&output_dir, &name),
        Command::NewManifest {
            version,
            key,
            output,
            optional_since,
            changelog,
            url_prefix,
            artifacts,
        } => {
            new_manifest::run(
                &version,
                &key,
                &output,
                optional_since.as_ref(),
                changelog.as_deref(),
                url_prefix.as_deref(),
                &artifacts,
            )
            .await
        }
        Command::Sign { body, key, output } => sign::run(&body, &key, &output),
        Command::Verify { manifest, key } => verify::run(&manifest, &key),
    }
}
