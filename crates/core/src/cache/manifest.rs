use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Hashes that produced the cached results of one analysis type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub firmware_hash: String,
    pub script_hash: String,
    pub last_updated: String,
}

/// `.manifest.toml`: one table per analysis type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Read the manifest; a missing file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(CacheError::Io { path: path.to_path_buf(), source }),
        };
        toml::from_str(&body).map_err(|source| CacheError::Parse { path: path.to_path_buf(), source })
    }

    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let body = toml::to_string(self)
            .map_err(|source| CacheError::Encode { what: "manifest".to_string(), source })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| CacheError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(path, body).map_err(|source| CacheError::Io { path: path.to_path_buf(), source })
    }

    pub fn entry(&self, analysis_type: &str) -> Option<&ManifestEntry> {
        self.entries.get(analysis_type)
    }

    /// Replace the entry for `analysis_type`, stamped with the current time.
    /// Other entries are left alone.
    pub fn update(&mut self, analysis_type: &str, firmware_hash: &str, script_hash: &str) {
        self.entries.insert(
            analysis_type.to_string(),
            ManifestEntry {
                firmware_hash: firmware_hash.to_string(),
                script_hash: script_hash.to_string(),
                last_updated: Utc::now().to_rfc3339(),
            },
        );
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_preserves_other_entries_across_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results/.manifest.toml");

        let mut manifest = Manifest::load(&path).unwrap();
        manifest.update("uboot", "aaaa", "bbbb");
        manifest.save(&path).unwrap();

        let mut manifest = Manifest::load(&path).unwrap();
        manifest.update("rootfs", "cccc", "dddd");
        manifest.save(&path).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.types().collect::<Vec<_>>(), vec!["rootfs", "uboot"]);
        assert_eq!(manifest.entry("uboot").unwrap().firmware_hash, "aaaa");
    }
}
