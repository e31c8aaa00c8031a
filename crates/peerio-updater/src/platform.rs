//! Host platform resolution.
//!
//! Maps the compile-target OS and architecture to the platform tag used in
//! manifest keys (`mac`, `windows`, `linux-x64`, ...). macOS and Windows
//! ship fat/single artifacts, so only Linux carries the architecture.

use crate::error::UpdateError;

/// Resolve the manifest platform tag for the host.
pub fn manifest_platform() -> Result<&'static str, UpdateError> {
    if cfg!(target_os = "macos") {
        Ok("mac")
    } else if cfg!(target_os = "windows") {
        Ok("windows")
    } else if cfg!(target_os = "linux") {
        if cfg!(target_arch = "x86_64") {
            Ok("linux-x64")
        } else if cfg!(target_arch = "aarch64") {
            Ok("linux-arm64")
        } else if cfg!(target_arch = "x86") {
            Ok("linux-ia32")
        } else if cfg!(target_arch = "arm") {
            Ok("linux-arm")
        } else {
            Err(unsupported())
        }
    } else {
        Err(unsupported())
    }
}

fn unsupported() -> UpdateError {
    UpdateError::UnsupportedPlatform {
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}
