use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::debug;

use super::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Shell,
    Python,
    /// The `fwprobe` executable itself.
    Executable,
}

/// What produces the results of one analysis type; its hash is the script
/// half of the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub path: PathBuf,
    pub kind: ScriptKind,
}

/// Finds `<type>.sh`, then `<type>.py` in the scripts directory, falling
/// back to the `fwprobe` executable.
#[derive(Debug, Clone)]
pub struct ScriptLocator {
    scripts_dir: Option<PathBuf>,
    executable: Option<PathBuf>,
}

impl ScriptLocator {
    pub fn new(scripts_dir: Option<PathBuf>) -> Self {
        Self { scripts_dir, executable: None }
    }

    /// Use `path` instead of the running executable as the fallback.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn locate(&self, analysis_type: &str) -> Result<Script, CacheError> {
        if let Some(dir) = &self.scripts_dir {
            let underscored = analysis_type.replace('-', "_");
            for (ext, kind) in [("sh", ScriptKind::Shell), ("py", ScriptKind::Python)] {
                for stem in [analysis_type, underscored.as_str()] {
                    let path = dir.join(format!("{stem}.{ext}"));
                    if path.is_file() {
                        return Ok(Script { path, kind });
                    }
                }
            }
        }
        let path = match &self.executable {
            Some(path) => path.clone(),
            None => env::current_exe().map_err(CacheError::NoExecutable)?,
        };
        Ok(Script { path, kind: ScriptKind::Executable })
    }
}

/// Produces the JSON results of one analysis.
pub trait AnalysisRunner {
    fn run(&self, analysis_type: &str, script: &Script, firmware: &Path) -> Result<Value, CacheError>;
}

/// Runs scripts as child processes and parses their stdout as JSON.
///
/// Shell scripts run under `bash`, Python under `python3`, and the
/// executable as `<exe> [global args] <type> --format json <firmware>`.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    global_args: Vec<OsString>,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments placed before the subcommand when re-invoking the executable
    /// (e.g. `--config <path>`).
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.global_args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    fn command(&self, analysis_type: &str, script: &Script, firmware: &Path) -> Command {
        match script.kind {
            ScriptKind::Shell | ScriptKind::Python => {
                let interpreter = if script.kind == ScriptKind::Shell { "bash" } else { "python3" };
                let mut cmd = Command::new(interpreter);
                cmd.arg(&script.path).arg(firmware);
                cmd
            }
            ScriptKind::Executable => {
                let mut cmd = Command::new(&script.path);
                cmd.args(&self.global_args)
                    .arg(analysis_type)
                    .args(["--format", "json"])
                    .arg(firmware);
                cmd
            }
        }
    }
}

impl AnalysisRunner for SubprocessRunner {
    fn run(&self, analysis_type: &str, script: &Script, firmware: &Path) -> Result<Value, CacheError> {
        let mut cmd = self.command(analysis_type, script, firmware);
        let program = cmd.get_program().to_string_lossy().to_string();
        debug!(program = %program, args = ?cmd.get_args().collect::<Vec<_>>(), "running analysis script");
        let output =
            cmd.output().map_err(|source| CacheError::Spawn { program: program.clone(), source })?;
        if !output.status.success() {
            return Err(CacheError::ScriptFailed {
                script: script.path.clone(),
                status: output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| format!("status {c}")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|source| CacheError::InvalidOutput { script: script.path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn shell_script_wins_over_python_and_executable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("boot_process.py"), "").unwrap();
        let locator =
            ScriptLocator::new(Some(dir.path().to_path_buf())).with_executable("/usr/bin/fwprobe");

        let script = locator.locate("boot-process").unwrap();
        assert_eq!(script.kind, ScriptKind::Python);

        fs::write(dir.path().join("boot-process.sh"), "").unwrap();
        let script = locator.locate("boot-process").unwrap();
        assert_eq!(script.kind, ScriptKind::Shell);
        assert_eq!(script.path, dir.path().join("boot-process.sh"));

        let fallback = locator.locate("rootfs").unwrap();
        assert_eq!(fallback, Script { path: "/usr/bin/fwprobe".into(), kind: ScriptKind::Executable });
    }
}
