use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::markdown::MarkdownDoc;
use super::{first_capture, gzip_payload_strings};
use crate::finders::{EntryKind, FileQuery};
use crate::offsets::{format_hex, OffsetManager};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

/// File name of the legacy Markdown summary.
pub const BOOT_PROCESS_MD: &str = "boot-process.md";

static UBOOT_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"U-Boot (\d{4}\.\d{2}[\w.+-]*)").expect("static regex"));
static OPTEE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)OP-TEE version:\s*([\w.+-]+)|optee_os[ -]v?(\d[\w.+-]*)")
        .expect("static regex")
});
static SOC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(rv11\d\d|rk3\d{3})\b").expect("static regex"));
static BOOTCMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bootcmd=(.+)$").expect("static regex"));
static BOOTARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bootargs=(.+)$").expect("static regex"));
static BOOTDELAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bootdelay=(.+)$").expect("static regex"));

/// One hop of the boot chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootStage {
    pub order: u32,
    pub name: String,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BootProcessAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub soc: Option<String>,
    pub uboot_version: Option<String>,
    pub optee_version: Option<String>,
    pub kernel_version: Option<String>,
    pub boot_command: Option<String>,
    pub bootargs: Option<String>,
    pub boot_delay: Option<String>,
    pub boot_stages: Vec<BootStage>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for BootProcessAnalysis {
    fn title(&self) -> &str {
        "Boot Process Analysis"
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
            "soc",
            "uboot_version",
            "optee_version",
            "kernel_version",
            "boot_command",
            "bootargs",
            "boot_delay",
        ])
    }
}

/// Stage table entries: (offset name, stage name, component, description).
const STAGES: [(&str, &str, &str, &str); 5] = [
    ("UBOOT_GZ", "Bootloader", "U-Boot", "Loads and verifies the kernel FIT"),
    ("OPTEE_GZ", "Secure world", "OP-TEE", "Trusted execution environment (BL32)"),
    ("KERNEL_FIT", "Kernel", "Linux kernel FIT", "Kernel image with its device tree"),
    ("ROOTFS_CPIO", "Initramfs", "cpio ramdisk", "Early userspace that mounts the root filesystem"),
    ("SQUASHFS", "Root filesystem", "SquashFS", "Read-only main filesystem"),
];

/// The boot chain implied by the offsets present, starting at the SoC boot ROM.
pub fn boot_stages(offsets: &OffsetManager) -> Vec<BootStage> {
    let mut stages = vec![BootStage {
        order: 1,
        name: "Boot ROM".to_string(),
        component: "SoC mask ROM".to_string(),
        offset: None,
        description: "Loads the first-stage loader from boot media".to_string(),
    }];
    for (name, stage, component, description) in STAGES {
        let Some(offset) = offsets.offset(name) else { continue };
        stages.push(BootStage {
            order: stages.len() as u32 + 1,
            name: stage.to_string(),
            component: component.to_string(),
            offset: Some(format_hex(offset)),
            description: description.to_string(),
        });
    }
    stages
}

fn optee_version(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|l| {
        let caps = OPTEE_VERSION.captures(l)?;
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
    })
}

fn render_markdown(report: &BootProcessAnalysis) -> String {
    let mut doc = MarkdownDoc::new("Boot Process Analysis");
    doc.line(format!("Firmware: `{}` ({} bytes)", report.firmware_file, report.firmware_size))
        .blank();

    doc.section("Boot Chain");
    let rows: Vec<Vec<String>> = report
        .boot_stages
        .iter()
        .map(|s| {
            vec![
                s.order.to_string(),
                s.name.clone(),
                s.component.clone(),
                s.offset.clone().unwrap_or_else(|| "-".to_string()),
                s.description.clone(),
            ]
        })
        .collect();
    doc.table(&["#", "Stage", "Component", "Offset", "Description"], &rows);

    doc.section("Versions");
    let unknown = || "unknown".to_string();
    doc.table(
        &["Component", "Version"],
        &[
            vec!["SoC".into(), report.soc.clone().unwrap_or_else(unknown)],
            vec!["U-Boot".into(), report.uboot_version.clone().unwrap_or_else(unknown)],
            vec!["OP-TEE".into(), report.optee_version.clone().unwrap_or_else(unknown)],
            vec!["Linux".into(), report.kernel_version.clone().unwrap_or_else(unknown)],
        ],
    );

    doc.section("Boot Configuration");
    for (label, value) in [
        ("bootcmd", &report.boot_command),
        ("bootargs", &report.bootargs),
        ("bootdelay", &report.boot_delay),
    ] {
        if let Some(value) = value {
            doc.line(format!("- `{label}`: `{value}`"));
        }
    }
    doc.finish()
}

pub struct BootProcessAnalyzer;

impl TopicAnalyzer for BootProcessAnalyzer {
    fn name(&self) -> &'static str {
        "boot-process"
    }

    fn description(&self) -> &'static str {
        "Boot chain stages, component versions and boot environment"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: true }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let offsets = ctx.offsets(self.name())?;
        let mut report = BootProcessAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            boot_stages: boot_stages(offsets),
            ..BootProcessAnalysis::default()
        };
        let offsets_source = ctx.layout.offsets_path.display().to_string();
        report.meta.add_metadata("boot_stages", &offsets_source, "Present *_OFFSET entries");

        let uboot = gzip_payload_strings(ctx, "UBOOT_GZ");
        let uboot_source = format!("U-Boot gzip payload at UBOOT_GZ ({offsets_source})");
        report.uboot_version = first_capture(&UBOOT_VERSION, &uboot);
        report.meta.add_metadata("uboot_version", &uboot_source, "Regex 'U-Boot YYYY.MM'");
        report.soc = first_capture(&SOC, &uboot).map(|s| s.to_uppercase());
        report.meta.add_metadata("soc", &uboot_source, "Rockchip SoC name in U-Boot strings");
        report.boot_command = first_capture(&BOOTCMD, &uboot);
        report.meta.add_metadata("boot_command", &uboot_source, "Default environment bootcmd=");
        report.bootargs = first_capture(&BOOTARGS, &uboot);
        report.meta.add_metadata("bootargs", &uboot_source, "Default environment bootargs=");
        report.boot_delay = first_capture(&BOOTDELAY, &uboot);
        report.meta.add_metadata("boot_delay", &uboot_source, "Default environment bootdelay=");

        let optee = gzip_payload_strings(ctx, "OPTEE_GZ");
        report.optee_version = optee_version(&optee);
        report.meta.add_metadata(
            "optee_version",
            format!("OP-TEE gzip payload at OPTEE_GZ ({offsets_source})"),
            "Regex 'OP-TEE version:' over strings",
        );

        if let Ok(root) = ctx.squashfs_root(self.name()) {
            let modules = root.join("lib/modules");
            report.kernel_version = FileQuery::new()
                .kind(EntryKind::Dir)
                .max_depth(1)
                .find_first(&modules)
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
            report.meta.add_metadata(
                "kernel_version",
                modules.display().to_string(),
                "Name of the lib/modules/<version> directory",
            );
        }

        let markdown = render_markdown(&report);
        Ok(AnalysisOutput::new(report).with_artifact(BOOT_PROCESS_MD, markdown))
    }
}
