//! Root filesystem inventory: OS identity, file statistics, setuid
//! binaries and GPL components that carry source-offer obligations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use super::relative_display;
use crate::extraction::scan_printable_strings;
use crate::finders::{EntryKind, FileQuery};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

/// Binaries larger than this are not read for a version string.
const MAX_VERSION_SCAN_BYTES: u64 = 16 * 1024 * 1024;

/// A GPL-family component and the regex that pulls its version out of the
/// binary's strings.
struct GplComponent {
    binary: &'static str,
    license: &'static str,
    version: Regex,
}

static GPL_COMPONENTS: LazyLock<Vec<GplComponent>> = LazyLock::new(|| {
    [
        ("busybox", "GPL-2.0", r"BusyBox v(\d+\.\d+(?:\.\d+)?)"),
        ("bash", "GPL-3.0", r"GNU bash, version (\d+\.\d+(?:\.\d+)?)"),
        ("dnsmasq", "GPL-2.0", r"dnsmasq-(\d+\.\d+(?:\.\d+)?)"),
        ("iptables", "GPL-2.0", r"iptables v(\d+\.\d+(?:\.\d+)?)"),
        ("ip", "GPL-2.0", r"iproute2-(?:ss)?(\d[\w.]*)"),
        ("e2fsck", "GPL-2.0", r"e2fsck (\d+\.\d+(?:\.\d+)?)"),
        ("mtd", "GPL-2.0", r"mtd-utils (\d+\.\d+(?:\.\d+)?)"),
        ("opkg", "GPL-2.0", r"opkg version ([\w.+-]+)"),
        ("ubusd", "LGPL-2.1", r"ubus (\d[\w.]*)"),
    ]
    .into_iter()
    .map(|(binary, license, pattern)| GplComponent {
        binary,
        license,
        version: Regex::new(pattern).expect("static regex"),
    })
    .collect()
});

const BIN_DIRS: [&str; 4] = ["bin", "sbin", "usr/bin", "usr/sbin"];

/// `os-release` / `openwrt_release` keys worth reporting.
const RELEASE_KEYS: [&str; 8] = [
    "NAME",
    "VERSION",
    "ID",
    "PRETTY_NAME",
    "BUILD_ID",
    "DISTRIB_ID",
    "DISTRIB_RELEASE",
    "DISTRIB_REVISION",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStatistics {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetuidBinary {
    pub path: String,
    pub mode: String,
    pub setgid: bool,
}

/// A GPL-family component shipped as a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GplBinary {
    pub name: String,
    pub path: String,
    pub version: Option<String>,
    pub license: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RootfsAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub busybox_version: Option<String>,
    pub release: BTreeMap<String, String>,
    pub statistics: FileStatistics,
    pub setuid_binaries: Vec<SetuidBinary>,
    pub gpl_binaries: Vec<GplBinary>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for RootfsAnalysis {
    fn title(&self) -> &str {
        "Root Filesystem Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }

    fn simple_fields(&self) -> Option<&'static [&'static str]> {
        Some(&[
            "firmware_file",
            "firmware_size",
            "os_name",
            "os_version",
            "kernel_version",
            "busybox_version",
        ])
    }
}

/// `KEY=value` / `KEY='value'` / `KEY="value"` lines.
pub fn parse_release(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            if key.is_empty() || key.starts_with('#') {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Counts and apparent size of everything below `root`; symlinks are not followed.
pub fn file_statistics(root: &Path) -> FileStatistics {
    let mut stats = FileStatistics::default();
    for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(Result::ok) {
        let kind = entry.file_type();
        if kind.is_symlink() {
            stats.symlinks += 1;
        } else if kind.is_dir() {
            stats.directories += 1;
        } else if kind.is_file() {
            stats.files += 1;
            stats.total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    stats
}

#[cfg(unix)]
fn setuid_binaries(root: &Path) -> Vec<SetuidBinary> {
    use std::os::unix::fs::PermissionsExt;

    FileQuery::new()
        .kind(EntryKind::File)
        .find(root)
        .into_iter()
        .filter_map(|path| {
            let mode = fs::symlink_metadata(&path).ok()?.permissions().mode();
            if mode & 0o4000 == 0 {
                return None;
            }
            Some(SetuidBinary {
                path: relative_display(&path, root),
                mode: format!("{:04o}", mode & 0o7777),
                setgid: mode & 0o2000 != 0,
            })
        })
        .collect()
}

#[cfg(not(unix))]
fn setuid_binaries(_root: &Path) -> Vec<SetuidBinary> {
    Vec::new()
}

/// Version string matched by `re` inside the file's printable strings.
fn binary_version(path: &Path, re: &Regex, min_len: usize) -> Option<String> {
    let size = fs::metadata(path).ok()?.len();
    if size > MAX_VERSION_SCAN_BYTES {
        debug!(path = %path.display(), size, "skipping version scan of large binary");
        return None;
    }
    let data = fs::read(path).ok()?;
    scan_printable_strings(&data, min_len)
        .iter()
        .find_map(|s| re.captures(s).map(|c| c[1].to_string()))
}

/// Known GPL components present as regular files (applet symlinks are skipped).
pub fn gpl_binaries(root: &Path, min_len: usize) -> Vec<GplBinary> {
    let mut found = Vec::new();
    for component in GPL_COMPONENTS.iter() {
        let regular = BIN_DIRS.iter().map(|d| root.join(d).join(component.binary)).find(|p| {
            fs::symlink_metadata(p).map(|m| m.file_type().is_file()).unwrap_or(false)
        });
        let Some(path) = regular else { continue };
        found.push(GplBinary {
            name: component.binary.to_string(),
            version: binary_version(&path, &component.version, min_len),
            path: relative_display(&path, root),
            license: component.license.to_string(),
        });
    }
    found
}

pub struct RootfsAnalyzer;

impl TopicAnalyzer for RootfsAnalyzer {
    fn name(&self) -> &'static str {
        "rootfs"
    }

    fn description(&self) -> &'static str {
        "OS release, file statistics, setuid binaries and GPL components"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: false }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let root = ctx.squashfs_root(self.name())?;
        let min_len = ctx.config.min_string_length;
        let mut report = RootfsAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            ..RootfsAnalysis::default()
        };

        for candidate in ["etc/os-release", "usr/lib/os-release", "etc/openwrt_release"] {
            let Ok(text) = fs::read_to_string(root.join(candidate)) else { continue };
            for (key, value) in parse_release(&text) {
                if RELEASE_KEYS.contains(&key.as_str()) {
                    report.release.entry(key).or_insert(value);
                }
            }
        }
        let field = |keys: &[&str]| keys.iter().find_map(|k| report.release.get(*k).cloned());
        report.os_name = field(&["NAME", "DISTRIB_ID"]);
        report.os_version = field(&["VERSION", "DISTRIB_RELEASE"]);
        let release_source = "squashfs-root/etc/{os-release,openwrt_release}";
        report.meta.add_metadata("release", release_source, "KEY=value pairs");
        report.meta.add_metadata("os_name", release_source, "NAME, else DISTRIB_ID");
        report.meta.add_metadata("os_version", release_source, "VERSION, else DISTRIB_RELEASE");

        report.kernel_version = FileQuery::new()
            .kind(EntryKind::Dir)
            .max_depth(1)
            .find_first(&root.join("lib/modules"))
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
        report.meta.add_metadata(
            "kernel_version",
            "squashfs-root/lib/modules",
            "Name of the lib/modules/<version> directory",
        );

        report.statistics = file_statistics(&root);
        let root_label = root.display().to_string();
        report.meta.add_metadata("statistics", &root_label, "walkdir without following symlinks");

        report.setuid_binaries = setuid_binaries(&root);
        report.meta.add_metadata("setuid_binaries", &root_label, "Regular files with mode & 04000");

        report.gpl_binaries = gpl_binaries(&root, min_len);
        report.meta.add_metadata(
            "gpl_binaries",
            "squashfs-root/{usr/,}{s,}bin",
            "Known GPL components as regular files; version regex over strings",
        );

        report.busybox_version =
            report.gpl_binaries.iter().find(|b| b.name == "busybox").and_then(|b| b.version.clone());
        report.meta.add_metadata("busybox_version", "squashfs-root/bin/busybox", "Regex 'BusyBox vX.Y.Z'");

        Ok(AnalysisOutput::new(report))
    }
}
