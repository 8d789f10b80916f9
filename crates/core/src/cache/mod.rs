//! Result cache for analysis runs, keyed by content hashes.
//!
//! A run is identified by the analysis type plus the hashes of the firmware
//! and of the script (or executable) that produces it. Results live as TOML in
//! the results directory; `.manifest.toml` records which hashes produced them.

mod manifest;
mod runner;
mod template;
mod tracked;

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::layout::ArtifactLayout;
use crate::report::json_to_toml;

pub use self::manifest::{Manifest, ManifestEntry};
pub use self::runner::{AnalysisRunner, Script, ScriptKind, ScriptLocator, SubprocessRunner};
pub use self::template::{normalize_type, TemplateRenderer};
pub use self::tracked::{track_fields, FootnoteRegistry, TrackedValue};

/// Hex characters kept from the SHA-256 digest.
pub const HASH_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to encode {what} as TOML: {source}")]
    Encode {
        what: String,
        #[source]
        source: toml::ser::Error,
    },
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{script} exited with {status}: {stderr}")]
    ScriptFailed { script: PathBuf, status: String, stderr: String },
    #[error("{script} did not print valid JSON: {source}")]
    InvalidOutput {
        script: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Results of '{0}' are not a table")]
    NotATable(String),
    #[error("Cannot locate the fwprobe executable: {0}")]
    NoExecutable(#[source] std::io::Error),
    #[error("Failed to render template: {0}")]
    Template(#[from] minijinja::Error),
}

/// First [`HASH_LEN`] hex characters of the file's SHA-256.
pub fn hash_file(path: &Path) -> Result<String, CacheError> {
    let hash_err = |source: std::io::Error| CacheError::Hash { path: path.to_path_buf(), source };
    let file = fs::File::open(path).map_err(hash_err)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(hash_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(HASH_LEN);
    Ok(hex)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    analysis_type: String,
    firmware_hash: String,
    script_hash: String,
}

/// Cache over analysis results with an in-process memo in front of the
/// on-disk results.
#[derive(Debug)]
pub struct AnalysisCache {
    layout: ArtifactLayout,
    locator: ScriptLocator,
    memo: HashMap<MemoKey, Value>,
}

impl AnalysisCache {
    pub fn new(layout: ArtifactLayout, locator: ScriptLocator) -> Self {
        Self { layout, locator, memo: HashMap::new() }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Whether cached results for `analysis_type` were produced from exactly
    /// this firmware and script. Any missing piece means "not valid".
    pub fn is_cache_valid(&self, analysis_type: &str, firmware: &Path, script: &Path) -> bool {
        let (Ok(firmware_hash), Ok(script_hash)) = (hash_file(firmware), hash_file(script)) else {
            return false;
        };
        self.matches_manifest(analysis_type, &firmware_hash, &script_hash)
    }

    fn matches_manifest(&self, analysis_type: &str, firmware_hash: &str, script_hash: &str) -> bool {
        if !self.layout.results_path(analysis_type).is_file() {
            return false;
        }
        match Manifest::load(&self.layout.manifest_path) {
            Ok(manifest) => manifest.entry(analysis_type).is_some_and(|e| {
                e.firmware_hash == firmware_hash && e.script_hash == script_hash
            }),
            Err(err) => {
                debug!(%err, "unreadable manifest treated as empty");
                false
            }
        }
    }

    /// Record the hashes that produced the current results of `analysis_type`.
    pub fn update_manifest(
        &self,
        analysis_type: &str,
        firmware_hash: &str,
        script_hash: &str,
    ) -> Result<(), CacheError> {
        let path = &self.layout.manifest_path;
        let mut manifest = Manifest::load(path)?;
        manifest.update(analysis_type, firmware_hash, script_hash);
        manifest.save(path)
    }

    /// Cached results of `analysis_type` as JSON.
    ///
    /// Results are stored as TOML, so a reload differs from the fresh run:
    /// `null` values are dropped (inside arrays too) and integers above
    /// `i64::MAX` come back as decimal strings.
    pub fn load_results(&self, analysis_type: &str) -> Result<Value, CacheError> {
        let path = self.layout.results_path(analysis_type);
        let body =
            fs::read_to_string(&path).map_err(|source| CacheError::Io { path: path.clone(), source })?;
        toml::from_str(&body).map_err(|source| CacheError::Parse { path, source })
    }

    fn save_results(&self, analysis_type: &str, results: &Value) -> Result<PathBuf, CacheError> {
        let Some(toml::Value::Table(table)) = json_to_toml(results) else {
            return Err(CacheError::NotATable(analysis_type.to_string()));
        };
        let body = toml::to_string(&table)
            .map_err(|source| CacheError::Encode { what: analysis_type.to_string(), source })?;
        let dir = &self.layout.results_dir;
        fs::create_dir_all(dir).map_err(|source| CacheError::Io { path: dir.clone(), source })?;
        let path = self.layout.results_path(analysis_type);
        fs::write(&path, body).map_err(|source| CacheError::Io { path: path.clone(), source })?;
        Ok(path)
    }

    /// Results of `analysis_type` for `firmware`, running the analysis only
    /// when neither the memo nor the on-disk cache matches the current hashes.
    pub fn analyze(
        &mut self,
        analysis_type: &str,
        firmware: &Path,
        runner: &dyn AnalysisRunner,
    ) -> Result<Value, CacheError> {
        let analysis_type = normalize_type(analysis_type);
        let script = self.locator.locate(&analysis_type)?;
        let key = MemoKey {
            firmware_hash: hash_file(firmware)?,
            script_hash: hash_file(&script.path)?,
            analysis_type: analysis_type.clone(),
        };

        if let Some(results) = self.memo.get(&key) {
            debug!(analysis = %analysis_type, "memo hit");
            return Ok(results.clone());
        }

        if self.matches_manifest(&analysis_type, &key.firmware_hash, &key.script_hash) {
            match self.load_results(&analysis_type) {
                Ok(results) => {
                    info!(analysis = %analysis_type, "using cached results");
                    self.memo.insert(key, results.clone());
                    return Ok(results);
                }
                Err(err) => debug!(%err, "cached results unreadable; re-running"),
            }
        }

        info!(analysis = %analysis_type, script = %script.path.display(), "running analysis");
        let results = runner.run(&analysis_type, &script, firmware)?;
        let path = self.save_results(&analysis_type, &results)?;
        self.update_manifest(&analysis_type, &key.firmware_hash, &key.script_hash)?;
        debug!(path = %path.display(), "results cached");
        self.memo.insert(key, results.clone());
        Ok(results)
    }
}
