use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "FWPROBE_CONFIG";

/// Config file picked up from the current directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "fwprobe.toml";

/// Release image downloaded when no firmware path is given.
pub const DEFAULT_FIRMWARE_URL: &str = "https://fw.gl-inet.com/kvm/rm1/release/glkvm-RM1-1.2.1.img";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// How embedded gzip streams are decompressed.
///
/// `Pipeline` shells out to `dd | gunzip` and tolerates trailing bytes after
/// the stream; `Strict` decodes in-process and rejects them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GzipStrategy {
    #[default]
    Pipeline,
    Strict,
}

/// Paths (or bare names resolved through `PATH`) of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub binwalk: PathBuf,
    pub strings: PathBuf,
    pub file: PathBuf,
    pub grep: PathBuf,
    pub dd: PathBuf,
    pub gunzip: PathBuf,
    pub curl: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            binwalk: PathBuf::from("binwalk"),
            strings: PathBuf::from("strings"),
            file: PathBuf::from("file"),
            grep: PathBuf::from("grep"),
            dd: PathBuf::from("dd"),
            gunzip: PathBuf::from("gunzip"),
            curl: PathBuf::from("curl"),
        }
    }
}

/// Injected configuration for every analysis run.
///
/// Loaded from `fwprobe.toml` (or `--config` / `FWPROBE_CONFIG`); every field
/// has a default so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Scratch area for downloaded firmware and binwalk extractions.
    pub work_dir: PathBuf,
    /// Where reports and legacy artifacts (`binwalk-offsets.sh`, ...) land.
    pub output_dir: PathBuf,
    /// Cache-layer results and `.manifest.toml`.
    pub results_dir: PathBuf,
    /// Optional directory holding external `<type>.sh` / `<type>.py` scripts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    /// Download URL used when no firmware path is given; defaults to
    /// [`DEFAULT_FIRMWARE_URL`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
    pub gzip_strategy: GzipStrategy,
    /// Password hashes shorter than this are reported as weak.
    pub weak_hash_length: usize,
    /// Minimum run length for the in-process printable string scanner.
    pub min_string_length: usize,
    pub tools: ToolPaths,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/fw_analysis"),
            output_dir: PathBuf::from("output"),
            results_dir: PathBuf::from("results"),
            scripts_dir: None,
            firmware_url: Some(DEFAULT_FIRMWARE_URL.to_string()),
            gzip_strategy: GzipStrategy::default(),
            weak_hash_length: 13,
            min_string_length: 4,
            tools: ToolPaths::default(),
        }
    }
}

impl AnalysisConfig {
    /// Parse a config file from disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let body = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&body)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Resolve the config: explicit path, then `FWPROBE_CONFIG`, then
    /// `./fwprobe.toml`, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(local);
        }
        Ok(Self::default())
    }
}
