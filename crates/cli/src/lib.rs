use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use fwprobe_core::config::AnalysisConfig;
use fwprobe_core::services::analysis::Session;

pub mod commands;
pub mod console;

/// Flags accepted by every subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl GlobalOptions {
    /// The same flags as command-line arguments, for re-invoking `fwprobe`.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--config", &self.config),
            ("--output-dir", &self.output_dir),
            ("--work-dir", &self.work_dir),
        ] {
            if let Some(value) = value {
                args.push(OsString::from(flag));
                args.push(value.clone().into_os_string());
            }
        }
        args
    }

    /// Load the config, apply flag overrides, and resolve relative paths
    /// against the current directory.
    pub fn load_config(&self) -> Result<AnalysisConfig> {
        let mut config = AnalysisConfig::load(self.config.as_deref())
            .context("Failed to load fwprobe configuration")?;
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        Ok(config)
    }

    pub fn session(&self) -> Result<Session> {
        let config = self.load_config()?;
        let base = env::current_dir().context("Failed to get current directory")?;
        Ok(Session::new(config, base))
    }
}
