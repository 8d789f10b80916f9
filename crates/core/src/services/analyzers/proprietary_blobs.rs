//! Closed-source components in the root filesystem: vendor libraries and
//! binaries, out-of-tree kernel modules and firmware blobs.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::relative_display;
use crate::finders::{EntryKind, FileQuery};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};
use crate::tools::{ToolError, ToolSet};

/// `MODULE_LICENSE` values the kernel treats as GPL-compatible.
const GPL_COMPATIBLE: [&str; 6] = [
    "GPL",
    "GPL v2",
    "GPL and additional rights",
    "Dual BSD/GPL",
    "Dual MIT/GPL",
    "Dual MPL/GPL",
];

/// Vendor shared libraries: (file-name glob, vendor, purpose).
const VENDOR_LIBRARIES: [(&str, &str, &str); 12] = [
    ("librockchip_mpp.so*", "Rockchip", "Media Process Platform (video codec)"),
    ("librga.so*", "Rockchip", "RGA 2D graphics accelerator"),
    ("librknn*.so*", "Rockchip", "RKNN NPU runtime"),
    ("librkaiq.so*", "Rockchip", "ISP auto image quality"),
    ("librkmedia*.so*", "Rockchip", "Rockit/RKMedia pipeline"),
    ("libeasymedia.so*", "Rockchip", "EasyMedia pipeline"),
    ("librockit*.so*", "Rockchip", "Rockit media framework"),
    ("librkisp*.so*", "Rockchip", "ISP control"),
    ("libmali*.so*", "Arm", "Mali GPU driver"),
    ("libglsdk*.so*", "GL.iNet", "GL.iNet SDK"),
    ("libgl_*.so*", "GL.iNet", "GL.iNet platform library"),
    ("libwifi*.so*", "Unknown", "Wi-Fi vendor library"),
];

/// Vendor executables: (file-name glob, vendor, purpose).
const VENDOR_BINARIES: [(&str, &str, &str); 7] = [
    ("rkipc", "Rockchip", "IP camera application"),
    ("mediaserver", "Rockchip", "Media server"),
    ("rkaiq_*", "Rockchip", "ISP tuning server"),
    ("gl_*", "GL.iNet", "GL.iNet platform service"),
    ("gl-*", "GL.iNet", "GL.iNet platform service"),
    ("kvmd*", "GL.iNet", "KVM daemon"),
    ("rk_*", "Rockchip", "Rockchip utility"),
];

/// A loadable kernel module and its `modinfo` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelModule {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub license: Option<String>,
    pub vermagic: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    /// No license, or one the kernel would taint on.
    pub proprietary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorFile {
    pub name: String,
    pub path: String,
    pub vendor: String,
    pub purpose: String,
    pub size: u64,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareBlob {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProprietaryBlobAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub kernel_module_count: usize,
    pub proprietary_module_count: usize,
    pub vendor_library_count: usize,
    pub vendor_binary_count: usize,
    pub firmware_blob_count: usize,
    pub kernel_modules: Vec<KernelModule>,
    pub vendor_libraries: Vec<VendorFile>,
    pub vendor_binaries: Vec<VendorFile>,
    pub firmware_blobs: Vec<FirmwareBlob>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for ProprietaryBlobAnalysis {
    fn title(&self) -> &str {
        "Proprietary Blob Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

pub fn is_gpl_compatible(license: &str) -> bool {
    GPL_COMPATIBLE.contains(&license.trim())
}

/// Fill `license=`, `vermagic=`, `author=` and `description=` from the
/// module's `.modinfo` strings. The first occurrence of each wins.
pub fn apply_modinfo(module: &mut KernelModule, strings: &[String]) {
    for line in strings {
        let Some((key, value)) = line.trim().split_once('=') else { continue };
        let slot = match key {
            "license" => &mut module.license,
            "vermagic" => &mut module.vermagic,
            "author" => &mut module.author,
            "description" => &mut module.description,
            _ => continue,
        };
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.trim().to_string());
        }
    }
    module.proprietary = !module.license.as_deref().is_some_and(is_gpl_compatible);
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// `file -b` output; only a missing `file` binary is an error.
fn describe(tools: &ToolSet, path: &Path) -> Result<Option<String>, ToolError> {
    match tools.file_type(path) {
        Ok(kind) => Ok(Some(kind)),
        Err(err @ ToolError::Missing { .. }) => Err(err),
        Err(err) => {
            debug!(path = %path.display(), %err, "file(1) failed");
            Ok(None)
        }
    }
}

fn kernel_modules(
    tools: &ToolSet,
    root: &Path,
    min_len: usize,
) -> Result<Vec<KernelModule>, ToolError> {
    let mut modules = Vec::new();
    for path in FileQuery::new().include("*.ko").kind(EntryKind::File).find(root) {
        let mut module = KernelModule {
            name: path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
            path: relative_display(&path, root),
            size: file_size(&path),
            ..KernelModule::default()
        };
        let strings = match tools.strings(&path, min_len) {
            Ok(lines) => lines,
            Err(err @ ToolError::Missing { .. }) => return Err(err),
            Err(err) => {
                debug!(path = %path.display(), %err, "strings failed on module");
                Vec::new()
            }
        };
        apply_modinfo(&mut module, &strings);
        modules.push(module);
    }
    Ok(modules)
}

fn vendor_files(
    tools: &ToolSet,
    root: &Path,
    dirs: &[&str],
    table: &[(&str, &str, &str)],
) -> Result<Vec<VendorFile>, ToolError> {
    let mut found = Vec::new();
    for dir in dirs {
        let base = root.join(dir);
        for (pattern, vendor, purpose) in table {
            let query = FileQuery::new().include(pattern).kind(EntryKind::File).max_depth(2);
            for path in query.find(&base) {
                let path_str = relative_display(&path, root);
                if found.iter().any(|f: &VendorFile| f.path == path_str) {
                    continue;
                }
                found.push(VendorFile {
                    name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                    path: path_str,
                    vendor: vendor.to_string(),
                    purpose: purpose.to_string(),
                    size: file_size(&path),
                    file_type: describe(tools, &path)?,
                });
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

fn firmware_blobs(root: &Path) -> Vec<FirmwareBlob> {
    let base = root.join("lib/firmware");
    FileQuery::new()
        .kind(EntryKind::File)
        .find(&base)
        .into_iter()
        .map(|path| FirmwareBlob {
            name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
            path: relative_display(&path, root),
            size: file_size(&path),
        })
        .collect()
}

pub struct ProprietaryBlobsAnalyzer;

impl TopicAnalyzer for ProprietaryBlobsAnalyzer {
    fn name(&self) -> &'static str {
        "proprietary-blobs"
    }

    fn description(&self) -> &'static str {
        "Vendor libraries and binaries, kernel module licenses and firmware blobs"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: false }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let root = ctx.squashfs_root(self.name())?;
        let mut report = ProprietaryBlobAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            ..ProprietaryBlobAnalysis::default()
        };

        report.kernel_modules = kernel_modules(&ctx.tools, &root, ctx.config.min_string_length)?;
        report.kernel_module_count = report.kernel_modules.len();
        report.proprietary_module_count =
            report.kernel_modules.iter().filter(|m| m.proprietary).count();
        report.meta.add_metadata(
            "kernel_modules",
            "squashfs-root/**/*.ko",
            "strings -a over each module; license=/vermagic= modinfo entries",
        );
        report.meta.add_metadata(
            "proprietary_module_count",
            "kernel_modules",
            "Modules whose license is missing or not GPL-compatible",
        );

        report.vendor_libraries =
            vendor_files(&ctx.tools, &root, &["usr/lib", "lib", "oem/usr/lib"], &VENDOR_LIBRARIES)?;
        report.vendor_library_count = report.vendor_libraries.len();
        report.meta.add_metadata(
            "vendor_libraries",
            "squashfs-root/{usr/,oem/usr/,}lib",
            "Known vendor library name patterns; file -b classification",
        );

        report.vendor_binaries = vendor_files(
            &ctx.tools,
            &root,
            &["usr/bin", "usr/sbin", "bin", "sbin", "oem/usr/bin"],
            &VENDOR_BINARIES,
        )?;
        report.vendor_binary_count = report.vendor_binaries.len();
        report.meta.add_metadata(
            "vendor_binaries",
            "squashfs-root/{usr/,oem/usr/,}{s,}bin",
            "Known vendor executable name patterns; file -b classification",
        );

        report.firmware_blobs = firmware_blobs(&root);
        report.firmware_blob_count = report.firmware_blobs.len();
        report.meta.add_metadata("firmware_blobs", "squashfs-root/lib/firmware", "Every regular file");

        Ok(AnalysisOutput::new(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modinfo_marks_non_gpl_modules_proprietary() {
        let strings: Vec<String> = ["license=Proprietary", "vermagic=5.10.110 SMP preempt mod_unload"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut module = KernelModule { name: "rknpu".into(), ..KernelModule::default() };
        apply_modinfo(&mut module, &strings);
        assert_eq!(module.license.as_deref(), Some("Proprietary"));
        assert_eq!(module.vermagic.as_deref(), Some("5.10.110 SMP preempt mod_unload"));
        assert!(module.proprietary);

        let mut gpl = KernelModule::default();
        apply_modinfo(&mut gpl, &["license=GPL v2".to_string()]);
        assert!(!gpl.proprietary);

        let mut unlicensed = KernelModule::default();
        apply_modinfo(&mut unlicensed, &[]);
        assert!(unlicensed.proprietary);
    }
}
