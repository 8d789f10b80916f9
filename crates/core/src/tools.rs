//! Synchronous wrappers around the external binary-analysis tools.
//!
//! Every call spawns exactly one process, blocks until it exits, and has no
//! timeout.

use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::debug;

use crate::config::ToolPaths;

/// The external tools this crate shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Binwalk,
    Strings,
    File,
    Grep,
    Dd,
    Gunzip,
    Curl,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Binwalk => "binwalk",
            Tool::Strings => "strings",
            Tool::File => "file",
            Tool::Grep => "grep",
            Tool::Dd => "dd",
            Tool::Gunzip => "gunzip",
            Tool::Curl => "curl",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(
        "{tool} not found at '{}'. Run inside the analysis shell that provides binwalk, strings, \
         file, grep, dd, gunzip and curl, or set [tools].{tool} in fwprobe.toml",
        path.display()
    )]
    Missing { tool: Tool, path: PathBuf },
    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to prepare directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed { tool: Tool, status: String, stderr: String },
}

/// Captured result of one tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Resolved tool paths plus helpers for the invocations the analyzers need.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    paths: ToolPaths,
}

impl ToolSet {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn path(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Binwalk => &self.paths.binwalk,
            Tool::Strings => &self.paths.strings,
            Tool::File => &self.paths.file,
            Tool::Grep => &self.paths.grep,
            Tool::Dd => &self.paths.dd,
            Tool::Gunzip => &self.paths.gunzip,
            Tool::Curl => &self.paths.curl,
        }
    }

    /// A `Command` for `tool`, for callers that need to wire pipes themselves.
    pub fn command(&self, tool: Tool) -> Command {
        Command::new(self.path(tool))
    }

    /// Whether the tool resolves to an existing file (directly or via `PATH`).
    pub fn is_available(&self, tool: Tool) -> bool {
        let path = self.path(tool);
        if path.components().count() > 1 {
            return path.is_file();
        }
        find_in_path(path).is_some()
    }

    /// Run `tool` and require a zero exit status.
    pub fn run<I, S>(&self, tool: Tool, args: I) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run_lenient(tool, args)?;
        if !output.success {
            return Err(ToolError::Failed {
                tool,
                status: output.code.map_or_else(|| "signal".to_string(), |c| format!("status {c}")),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Run `tool` and return its output whatever the exit status.
    pub fn run_lenient<I, S>(&self, tool: Tool, args: I) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(tool);
        cmd.args(args);
        debug!(tool = %tool, args = ?cmd.get_args().collect::<Vec<_>>(), "running external tool");
        let output = cmd.output().map_err(|e| self.spawn_error(tool, e))?;
        Ok(convert_output(output))
    }

    pub(crate) fn spawn_error(&self, tool: Tool, source: std::io::Error) -> ToolError {
        if source.kind() == ErrorKind::NotFound {
            ToolError::Missing { tool, path: self.path(tool).to_path_buf() }
        } else {
            ToolError::Spawn { tool, source }
        }
    }

    /// `binwalk <firmware>`: the signature table as text.
    pub fn binwalk_scan(&self, firmware: &Path) -> Result<String, ToolError> {
        Ok(self.run(Tool::Binwalk, [firmware])?.stdout_lossy())
    }

    /// `binwalk -e -C <dir> <firmware>`.
    pub fn binwalk_extract(&self, firmware: &Path, dir: &Path) -> Result<(), ToolError> {
        let args: [&OsStr; 4] =
            ["-e".as_ref(), "-C".as_ref(), dir.as_os_str(), firmware.as_os_str()];
        self.run(Tool::Binwalk, args)?;
        Ok(())
    }

    /// `strings -a -n <min> <file>`, one entry per line.
    pub fn strings(&self, file: &Path, min_len: usize) -> Result<Vec<String>, ToolError> {
        let min = min_len.to_string();
        let args: [&OsStr; 4] = ["-a".as_ref(), "-n".as_ref(), min.as_ref(), file.as_os_str()];
        let out = self.run(Tool::Strings, args)?;
        Ok(out.stdout_lossy().lines().map(str::to_string).collect())
    }

    /// `file -b <path>`: the one-line type description.
    pub fn file_type(&self, path: &Path) -> Result<String, ToolError> {
        let args: [&OsStr; 2] = ["-b".as_ref(), path.as_os_str()];
        Ok(self.run(Tool::File, args)?.stdout_lossy().trim().to_string())
    }

    /// `grep -rlIE <pattern> <dir>`; exit status 1 (no match) is an empty list.
    pub fn grep_files(&self, pattern: &str, dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        let args: [&OsStr; 3] = ["-rlIE".as_ref(), pattern.as_ref(), dir.as_os_str()];
        let out = self.run_lenient(Tool::Grep, args)?;
        if !out.success && !out.stdout.is_empty() {
            debug!(stderr = %out.stderr.trim(), "grep reported errors");
        }
        let mut files: Vec<PathBuf> =
            out.stdout_lossy().lines().filter(|l| !l.is_empty()).map(PathBuf::from).collect();
        files.sort();
        Ok(files)
    }

    /// `curl -fL -o <dest> <url>`.
    pub fn curl_download(&self, url: &str, dest: &Path) -> Result<(), ToolError> {
        let args: [&OsStr; 4] = ["-fL".as_ref(), "-o".as_ref(), dest.as_os_str(), url.as_ref()];
        self.run(Tool::Curl, args)?;
        Ok(())
    }
}

fn convert_output(output: Output) -> ToolOutput {
    ToolOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        code: output.status.code(),
    }
}

fn find_in_path(executable: &Path) -> Option<PathBuf> {
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths).find_map(|p| {
            let candidate = p.join(executable);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
    })
}
