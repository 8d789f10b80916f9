use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::config::AnalysisConfig;
use crate::tools::{ToolError, ToolSet};

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Firmware file not found: {0}")]
    NotFound(PathBuf),
    #[error("No firmware given and no firmware_url configured")]
    NoSource,
    #[error("Firmware URL has no file name component: {0}")]
    BadUrl(String),
    #[error("Failed to prepare work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read firmware metadata for {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Firmware download failed: {0}")]
    Download(#[from] ToolError),
}

/// The image under analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

impl FirmwareImage {
    /// Open an existing image.
    pub fn open(path: &Path) -> Result<Self, FirmwareError> {
        if !path.is_file() {
            return Err(FirmwareError::NotFound(path.to_path_buf()));
        }
        let size = fs::metadata(path)
            .map_err(|source| FirmwareError::Metadata { path: path.to_path_buf(), source })?
            .len();
        let file_name =
            path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        Ok(Self { path: path.to_path_buf(), file_name, size })
    }

    /// Use `path` when given, otherwise download `firmware_url` into `work_dir`.
    ///
    /// An already-downloaded file of the same name is reused without checking
    /// its contents.
    pub fn resolve(
        config: &AnalysisConfig,
        work_dir: &Path,
        tools: &ToolSet,
        path: Option<&Path>,
    ) -> Result<Self, FirmwareError> {
        if let Some(path) = path {
            return Self::open(path);
        }
        let url = config.firmware_url.as_deref().ok_or(FirmwareError::NoSource)?;
        let name = url_file_name(url).ok_or_else(|| FirmwareError::BadUrl(url.to_string()))?;
        let dest = work_dir.join(name);
        if dest.is_file() {
            info!(path = %dest.display(), "using previously downloaded firmware");
            return Self::open(&dest);
        }
        fs::create_dir_all(work_dir)
            .map_err(|source| FirmwareError::WorkDir { path: work_dir.to_path_buf(), source })?;
        info!(%url, dest = %dest.display(), "downloading firmware");
        tools.curl_download(url, &dest)?;
        Self::open(&dest)
    }
}

/// Last path segment of a URL, ignoring any query string or fragment.
fn url_file_name(url: &str) -> Option<&str> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed.rsplit('/').next().filter(|s| !s.is_empty() && !s.contains(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_file_name_strips_query() {
        assert_eq!(
            url_file_name("https://fw.gl-inet.com/kvm/rm1/release/glkvm-RM1-1.2.1.img?dl=1"),
            Some("glkvm-RM1-1.2.1.img")
        );
        assert_eq!(url_file_name("https://example.com/"), None);
    }

    #[test]
    fn missing_path_and_url_is_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig { firmware_url: None, ..AnalysisConfig::default() };
        let err = FirmwareImage::resolve(&config, dir.path(), &ToolSet::default(), None)
            .unwrap_err();
        assert!(matches!(err, FirmwareError::NoSource));
    }

    #[test]
    fn default_url_reuses_an_earlier_download() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("glkvm-RM1-1.2.1.img"), b"cached").unwrap();
        let image = FirmwareImage::resolve(
            &AnalysisConfig::default(),
            dir.path(),
            &ToolSet::default(),
            None,
        )
        .unwrap();
        assert_eq!(image.file_name, "glkvm-RM1-1.2.1.img");
        assert_eq!(image.size, 6);
    }

    #[cfg(unix)]
    #[test]
    fn default_url_is_downloaded_with_curl() {
        use std::os::unix::fs::PermissionsExt;

        use crate::config::ToolPaths;

        let dir = tempfile::tempdir().unwrap();
        let curl = dir.path().join("curl");
        // Arguments are `-fL -o <dest> <url>`; record the URL as the image.
        fs::write(&curl, "#!/bin/sh\nprintf '%s' \"$4\" > \"$3\"\n").unwrap();
        fs::set_permissions(&curl, fs::Permissions::from_mode(0o755)).unwrap();
        let tools = ToolSet::new(ToolPaths { curl, ..ToolPaths::default() });

        let work_dir = dir.path().join("work");
        let image =
            FirmwareImage::resolve(&AnalysisConfig::default(), &work_dir, &tools, None).unwrap();
        assert_eq!(image.path, work_dir.join("glkvm-RM1-1.2.1.img"));
        assert_eq!(
            fs::read_to_string(&image.path).unwrap(),
            crate::config::DEFAULT_FIRMWARE_URL
        );
    }
}
