//! Cross-platform application paths using the `dirs` crate.
//!
//! Layout:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\panauricon\
//!   macOS:   ~/Library/Application Support/panauricon/
//!   Linux:   ~/.config/panauricon/
//!
//! Data dir (default storage root):
//!   Windows: %LOCALAPPDATA%\panauricon\
//!   macOS:   ~/Library/Application Support/panauricon/
//!   Linux:   ~/.local/share/panauricon/
//!
//! Inside a storage root:
//!
//! ```text
//! <root>/index.jsonl          segment catalog
//! <root>/recordings/<partition>/<prefix><timestamp>.wav
//! ```

use std::path::{Path, PathBuf};

/// Name of the index file inside a storage root.
pub const INDEX_FILE_NAME: &str = "index.jsonl";
/// Name of the recordings tree inside a storage root.
pub const RECORDINGS_DIR_NAME: &str = "recordings";

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Storage root used when the settings do not name one.
    pub default_storage_root: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "panauricon";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let default_storage_root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let settings_file = config_dir.join("settings.toml");

        Self {
            config_dir,
            settings_file,
            default_storage_root,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of the index file for a storage root.
pub fn index_file(root: &Path) -> PathBuf {
    root.join(INDEX_FILE_NAME)
}

/// Path of the recordings tree for a storage root.
pub fn recordings_dir(root: &Path) -> PathBuf {
    root.join(RECORDINGS_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_non_empty() {
        let paths = AppPaths::new();
        assert!(paths.config_dir.to_str().is_some_and(|s| !s.is_empty()));
        assert!(paths
            .default_storage_root
            .to_str()
            .is_some_and(|s| !s.is_empty()));
        assert!(paths
            .settings_file
            .file_name()
            .is_some_and(|n| n == "settings.toml"));
    }

    #[test]
    fn storage_layout_is_relative_to_root() {
        let root = Path::new("/srv/audio");
        assert_eq!(index_file(root), Path::new("/srv/audio/index.jsonl"));
        assert_eq!(recordings_dir(root), Path::new("/srv/audio/recordings"));
    }
}
