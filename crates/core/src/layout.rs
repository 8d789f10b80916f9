use std::path::{Path, PathBuf};

use crate::config::AnalysisConfig;

/// File name of the canonical offsets artifact.
pub const OFFSETS_FILE: &str = "binwalk-offsets.sh";

/// File name of the cache-layer manifest inside the results directory.
pub const MANIFEST_FILE: &str = ".manifest.toml";

/// Logical layout of the on-disk artifacts for an analysis run.
///
/// Derived from the config and a base directory for relative paths. It does
/// not perform any IO itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    /// Scratch directory (downloads land here).
    pub work_dir: PathBuf,
    /// Parent of every `<file>.extracted` directory.
    pub extractions_dir: PathBuf,
    /// Generated reports and legacy files.
    pub output_dir: PathBuf,
    /// Path to `binwalk-offsets.sh`.
    pub offsets_path: PathBuf,
    /// Cache-layer results (`<type>.toml`).
    pub results_dir: PathBuf,
    /// Path to `.manifest.toml`.
    pub manifest_path: PathBuf,
}

impl ArtifactLayout {
    /// Compute the layout, resolving relative config paths against `base`.
    pub fn new(config: &AnalysisConfig, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

        let work_dir = resolve(&config.work_dir);
        let extractions_dir = work_dir.join("extractions");
        let output_dir = resolve(&config.output_dir);
        let offsets_path = output_dir.join(OFFSETS_FILE);
        let results_dir = resolve(&config.results_dir);
        let manifest_path = results_dir.join(MANIFEST_FILE);

        Self { work_dir, extractions_dir, output_dir, offsets_path, results_dir, manifest_path }
    }

    /// Path of the cached results file for one analysis type.
    pub fn results_path(&self, analysis_type: &str) -> PathBuf {
        self.results_dir.join(format!("{analysis_type}.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_base() {
        let config = AnalysisConfig::default();
        let layout = ArtifactLayout::new(&config, "/repo");
        assert_eq!(layout.output_dir, PathBuf::from("/repo/output"));
        assert_eq!(layout.offsets_path, PathBuf::from("/repo/output/binwalk-offsets.sh"));
        assert_eq!(layout.manifest_path, PathBuf::from("/repo/results/.manifest.toml"));
        assert_eq!(layout.extractions_dir, PathBuf::from("/tmp/fw_analysis/extractions"));
        assert_eq!(layout.results_path("uboot"), PathBuf::from("/repo/results/uboot.toml"));
    }
}
