//! Native-messaging host manifest generation.
//!
//! Browsers locate the host binary through a small JSON manifest installed in
//! a per-browser directory. Chromium-family browsers allow extensions by
//! origin (`chrome-extension://<id>/`); Firefox allows them by add-on id.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::constants::NATIVE_HOST_NAME;

/// Browser the manifest is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Browser {
    /// Google Chrome.
    Chrome,
    /// Chromium.
    Chromium,
    /// Mozilla Firefox.
    Firefox,
}

impl Browser {
    fn is_chromium_family(self) -> bool {
        matches!(self, Self::Chrome | Self::Chromium)
    }

    /// Per-user directory the browser reads host manifests from.
    pub fn manifest_dir(self) -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(self.relative_manifest_dir()))
    }

    #[cfg(target_os = "macos")]
    fn relative_manifest_dir(self) -> &'static str {
        match self {
            Self::Chrome => "Library/Application Support/Google/Chrome/NativeMessagingHosts",
            Self::Chromium => "Library/Application Support/Chromium/NativeMessagingHosts",
            Self::Firefox => "Library/Application Support/Mozilla/NativeMessagingHosts",
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn relative_manifest_dir(self) -> &'static str {
        match self {
            Self::Chrome => ".config/google-chrome/NativeMessagingHosts",
            Self::Chromium => ".config/chromium/NativeMessagingHosts",
            Self::Firefox => ".mozilla/native-messaging-hosts",
        }
    }
}

/// Manifest registering `host_path` for `extension_id`.
pub fn build(browser: Browser, host_path: &Path, extension_id: &str) -> Value {
    let mut manifest = json!({
        "name": NATIVE_HOST_NAME,
        "description": "Wallet bridge native messaging host",
        "path": host_path.display().to_string(),
        "type": "stdio",
    });
    if browser.is_chromium_family() {
        manifest["allowed_origins"] = json!([format!("chrome-extension://{extension_id}/")]);
    } else {
        manifest["allowed_extensions"] = json!([extension_id]);
    }
    manifest
}

/// Write the manifest into `dir` as `<host name>.json`; returns the file path.
pub fn install(manifest: &Value, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{NATIVE_HOST_NAME}.json"));
    fs::write(&path, serde_json::to_string_pretty(manifest)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Installed native messaging manifest at {}", path.display());
    Ok(path)
}
