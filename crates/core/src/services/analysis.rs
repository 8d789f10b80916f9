use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::extraction::ensure_extracted;
use crate::finders::find_squashfs_root;
use crate::firmware::{FirmwareError, FirmwareImage};
use crate::layout::ArtifactLayout;
use crate::offsets::{OffsetError, OffsetManager};
use crate::report::{Report, ReportError};
use crate::tools::{ToolError, ToolSet};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Offsets(#[from] OffsetError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("No squashfs-root directory found under {0}")]
    SquashfsRootMissing(PathBuf),
    #[error("Analyzer '{analyzer}' needs {what}, which was not prepared")]
    NotPrepared { analyzer: &'static str, what: &'static str },
    #[error("Unknown analyzer '{name}' (available: {available})")]
    UnknownAnalyzer { name: String, available: String },
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What an analyzer needs before `analyze` runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    /// A `binwalk -e` extraction of the firmware.
    pub extraction: bool,
    /// `binwalk-offsets.sh`; a missing file is an error. Without this flag the
    /// file is still loaded when present.
    pub offsets: bool,
}

/// A side file written next to the reports (`binwalk-offsets.sh`, legacy
/// Markdown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub contents: String,
}

pub struct AnalysisOutput {
    pub report: Box<dyn Report>,
    pub artifacts: Vec<Artifact>,
}

impl AnalysisOutput {
    pub fn new(report: impl Report + 'static) -> Self {
        Self { report: Box::new(report), artifacts: Vec::new() }
    }

    pub fn with_artifact(mut self, file_name: impl Into<String>, contents: String) -> Self {
        self.artifacts.push(Artifact { file_name: file_name.into(), contents });
        self
    }

    /// Write every artifact into `dir`, overwriting earlier versions.
    pub fn write_artifacts(&self, dir: &Path) -> Result<Vec<PathBuf>, AnalysisError> {
        if self.artifacts.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(dir)
            .map_err(|source| AnalysisError::Io { path: dir.to_path_buf(), source })?;
        let mut written = Vec::with_capacity(self.artifacts.len());
        for artifact in &self.artifacts {
            let path = dir.join(&artifact.file_name);
            fs::write(&path, &artifact.contents)
                .map_err(|source| AnalysisError::Io { path: path.clone(), source })?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Everything one analyzer run can look at.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub config: AnalysisConfig,
    pub layout: ArtifactLayout,
    pub tools: ToolSet,
    pub firmware: FirmwareImage,
    pub extraction_dir: Option<PathBuf>,
    pub offsets: Option<OffsetManager>,
}

impl AnalysisContext {
    /// The extraction directory, or `NotPrepared` when the analyzer did not
    /// ask for one.
    pub fn extraction(&self, analyzer: &'static str) -> Result<&Path, AnalysisError> {
        self.extraction_dir
            .as_deref()
            .ok_or(AnalysisError::NotPrepared { analyzer, what: "a binwalk extraction" })
    }

    pub fn offsets(&self, analyzer: &'static str) -> Result<&OffsetManager, AnalysisError> {
        self.offsets.as_ref().ok_or(AnalysisError::NotPrepared { analyzer, what: "offsets" })
    }

    /// The `squashfs-root` directory inside the extraction.
    pub fn squashfs_root(&self, analyzer: &'static str) -> Result<PathBuf, AnalysisError> {
        let extraction = self.extraction(analyzer)?;
        find_squashfs_root(extraction)
            .ok_or_else(|| AnalysisError::SquashfsRootMissing(extraction.to_path_buf()))
    }

    /// The firmware path as shown in report provenance.
    pub fn firmware_label(&self) -> String {
        self.firmware.path.display().to_string()
    }
}

/// One topic-specific report over a firmware image.
pub trait TopicAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn requirements(&self) -> Requirements;
    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError>;
}

/// Registry for topic analyzers; callers select by name.
#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<String, Box<dyn TopicAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self { analyzers: HashMap::new() }
    }

    pub fn register<A: TopicAnalyzer + 'static>(&mut self, analyzer: A) -> &mut Self {
        self.analyzers.insert(analyzer.name().to_string(), Box::new(analyzer));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn TopicAnalyzer> {
        self.analyzers.get(name).map(|a| &**a)
    }

    /// Like `get`, but an unknown name is an error listing the valid ones.
    pub fn require(&self, name: &str) -> Result<&dyn TopicAnalyzer, AnalysisError> {
        self.get(name).ok_or_else(|| AnalysisError::UnknownAnalyzer {
            name: name.to_string(),
            available: self.names().join(", "),
        })
    }

    /// Sorted analyzer names, for help text and error messages.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.analyzers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Registry holding every built-in analyzer.
pub fn default_registry() -> AnalyzerRegistry {
    use crate::services::analyzers::*;

    let mut registry = AnalyzerRegistry::new();
    registry
        .register(BinwalkAnalyzer)
        .register(PartitionsAnalyzer)
        .register(BootProcessAnalyzer)
        .register(UBootAnalyzer)
        .register(SecureBootAnalyzer)
        .register(DeviceTreesAnalyzer)
        .register(NetworkServicesAnalyzer)
        .register(ProprietaryBlobsAnalyzer)
        .register(RootfsAnalyzer);
    registry
}

/// Config, layout and tools shared by every run in one process.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: AnalysisConfig,
    pub layout: ArtifactLayout,
    pub tools: ToolSet,
}

impl Session {
    /// Build a session, resolving relative config paths against `base`.
    pub fn new(config: AnalysisConfig, base: impl AsRef<Path>) -> Self {
        let layout = ArtifactLayout::new(&config, base);
        let tools = ToolSet::new(config.tools.clone());
        Self { config, layout, tools }
    }

    /// Resolve the firmware and satisfy `requirements`.
    pub fn context(
        &self,
        requirements: Requirements,
        firmware: Option<&Path>,
    ) -> Result<AnalysisContext, AnalysisError> {
        let firmware =
            FirmwareImage::resolve(&self.config, &self.layout.work_dir, &self.tools, firmware)?;
        debug!(path = %firmware.path.display(), size = firmware.size, "firmware resolved");

        let extraction_dir = if requirements.extraction {
            Some(ensure_extracted(&self.tools, &firmware.path, &self.layout.extractions_dir)?)
        } else {
            None
        };

        let offsets = if requirements.offsets {
            Some(OffsetManager::load_from_shell_script(Some(&self.layout.output_dir), None)?)
        } else {
            OffsetManager::load_from_shell_script(Some(&self.layout.output_dir), None).ok()
        };

        Ok(AnalysisContext {
            config: self.config.clone(),
            layout: self.layout.clone(),
            tools: self.tools.clone(),
            firmware,
            extraction_dir,
            offsets,
        })
    }

    /// Prepare, run `analyzer`, and write its artifacts into `output_dir`.
    pub fn run(
        &self,
        analyzer: &dyn TopicAnalyzer,
        firmware: Option<&Path>,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let ctx = self.context(analyzer.requirements(), firmware)?;
        info!(analyzer = analyzer.name(), firmware = %ctx.firmware.file_name, "running analysis");
        let output = analyzer.analyze(&ctx)?;
        for path in output.write_artifacts(&self.layout.output_dir)? {
            info!(path = %path.display(), "wrote artifact");
        }
        Ok(output)
    }
}
