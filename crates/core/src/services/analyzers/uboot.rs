//! U-Boot identity, default environment and feature set, read from the
//! decompressed U-Boot payload.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::first_capture;
use super::gzip_payload;
use super::markdown::MarkdownDoc;
use crate::extraction::scan_printable_strings;
use crate::offsets::format_hex;
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

/// File name of the legacy Markdown summary.
pub const UBOOT_VERSION_MD: &str = "uboot-version.md";

static VERSION_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(U-Boot \d{4}\.\d{2}[\w.+-]*(?:\s*\([^)]*\))?)").expect("static regex")
});
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"U-Boot (\d{4}\.\d{2}[\w.+-]*)").expect("static regex"));
static BUILD_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"U-Boot \d{4}\.\d{2}[\w.+-]*\s*\(([A-Z][a-z]{2} \d{1,2} \d{4}[^)]*)\)")
        .expect("static regex")
});
static TOOLCHAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:[\w.-]+-)?gcc(?: \([^)]*\))? \d+\.\d+(?:\.\d+)?[^\n]*)").expect("static regex")
});
static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z][a-z0-9_]{2,31})=([^%]+)$").expect("static regex"));

/// Commands detected by exact string match.
const KNOWN_COMMANDS: [&str; 28] = [
    "bootm", "bootz", "booti", "bootefi", "fdt", "mmc", "usb", "sf", "nand", "ubi", "gpt",
    "part", "tftpboot", "dhcp", "ping", "setenv", "saveenv", "printenv", "fastboot", "rockusb",
    "ums", "md", "mw", "go", "source", "load", "fatload", "ext4load",
];

/// Security-relevant features: (name, any-of marker strings).
const FEATURES: [(&str, &[&str]); 7] = [
    ("FIT signature verification", &["Verifying Hash Integrity", "sig-required", "required-node"]),
    ("Android Verified Boot", &["avb_slot_verify", "AVB verification"]),
    ("Fastboot", &["fastboot"]),
    ("Rockusb download mode", &["rockusb"]),
    ("USB mass storage (ums)", &["UMS: "]),
    ("Network boot", &["tftpboot", "TFTP from server"]),
    ("Autoboot interrupt", &["Hit any key to stop autoboot", "autoboot"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UBootFeature {
    pub name: String,
    pub evidence: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UBootAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub uboot_offset: Option<String>,
    pub decompressed_size: Option<u64>,
    pub version: Option<String>,
    pub version_banner: Option<String>,
    pub build_date: Option<String>,
    pub toolchain: Option<String>,
    pub boot_delay: Option<String>,
    pub commands: Vec<String>,
    pub environment: Vec<EnvVariable>,
    pub features: Vec<UBootFeature>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for UBootAnalysis {
    fn title(&self) -> &str {
        "U-Boot Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// `name=value` strings that look like default-environment entries; the
/// first value seen for a name wins.
pub fn environment_variables(lines: &[String]) -> Vec<EnvVariable> {
    let mut seen = BTreeSet::new();
    lines
        .iter()
        .filter_map(|l| ENV_VAR.captures(l.trim()))
        .filter(|c| seen.insert(c[1].to_string()))
        .map(|c| EnvVariable { name: c[1].to_string(), value: c[2].trim().to_string() })
        .collect()
}

pub fn detect_commands(lines: &[String]) -> Vec<String> {
    let present: BTreeSet<&str> = lines.iter().map(|l| l.trim()).collect();
    KNOWN_COMMANDS.iter().filter(|c| present.contains(*c)).map(|c| c.to_string()).collect()
}

pub fn detect_features(lines: &[String]) -> Vec<UBootFeature> {
    FEATURES
        .iter()
        .filter_map(|(name, markers)| {
            let hit = lines.iter().find(|l| markers.iter().any(|m| l.contains(m)))?;
            Some(UBootFeature { name: name.to_string(), evidence: hit.trim().to_string() })
        })
        .collect()
}

/// Fill every string-derived field from the payload's printable strings.
pub fn analyze_uboot_strings(report: &mut UBootAnalysis, lines: &[String], source: &str) {
    report.version = first_capture(&VERSION, lines);
    report.meta.add_metadata("version", source, "Regex 'U-Boot YYYY.MM' over strings");
    report.version_banner = first_capture(&VERSION_BANNER, lines);
    report.meta.add_metadata("version_banner", source, "Full U-Boot banner string");
    report.build_date = first_capture(&BUILD_DATE, lines);
    report.meta.add_metadata("build_date", source, "Date in parentheses after the banner");
    report.toolchain = first_capture(&TOOLCHAIN, lines);
    report.meta.add_metadata("toolchain", source, "First gcc version string");
    report.environment = environment_variables(lines);
    report.meta.add_metadata("environment", source, "name=value strings of the default env");
    report.boot_delay =
        report.environment.iter().find(|v| v.name == "bootdelay").map(|v| v.value.clone());
    report.meta.add_metadata("boot_delay", source, "bootdelay= in the default environment");
    report.commands = detect_commands(lines);
    report.meta.add_metadata("commands", source, "Known command names present as exact strings");
    report.features = detect_features(lines);
    report.meta.add_metadata("features", source, "Marker strings per feature");
}

fn render_markdown(report: &UBootAnalysis) -> String {
    let mut doc = MarkdownDoc::new("U-Boot Version Analysis");
    doc.line(format!("Firmware: `{}`", report.firmware_file)).blank();

    doc.section("Version");
    let cell = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
    doc.table(
        &["Property", "Value"],
        &[
            vec!["Version".into(), cell(&report.version)],
            vec!["Banner".into(), cell(&report.version_banner)],
            vec!["Build date".into(), cell(&report.build_date)],
            vec!["Toolchain".into(), cell(&report.toolchain)],
            vec!["Offset".into(), cell(&report.uboot_offset)],
            vec!["Boot delay".into(), cell(&report.boot_delay)],
        ],
    );

    if !report.features.is_empty() {
        doc.section("Features");
        let rows: Vec<Vec<String>> =
            report.features.iter().map(|f| vec![f.name.clone(), f.evidence.clone()]).collect();
        doc.table(&["Feature", "Evidence"], &rows);
    }
    if !report.commands.is_empty() {
        doc.section("Commands");
        doc.line(report.commands.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", "));
    }
    doc.finish()
}

pub struct UBootAnalyzer;

impl TopicAnalyzer for UBootAnalyzer {
    fn name(&self) -> &'static str {
        "uboot"
    }

    fn description(&self) -> &'static str {
        "U-Boot version, toolchain, default environment and features"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: false, offsets: true }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let offsets = ctx.offsets(self.name())?;
        let mut report = UBootAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            uboot_offset: offsets.offset("UBOOT_GZ").map(format_hex),
            ..UBootAnalysis::default()
        };
        let offsets_source = ctx.layout.offsets_path.display().to_string();
        report.meta.add_metadata("uboot_offset", &offsets_source, "UBOOT_GZ_OFFSET");

        if let Some(payload) = gzip_payload(ctx, "UBOOT_GZ") {
            let source = format!(
                "{} @ UBOOT_GZ (gzip, {:?})",
                ctx.firmware.file_name, ctx.config.gzip_strategy
            );
            report.decompressed_size = Some(payload.len() as u64);
            report.meta.add_metadata("decompressed_size", &source, "Length of gunzipped payload");
            let lines = scan_printable_strings(&payload, ctx.config.min_string_length);
            analyze_uboot_strings(&mut report, &lines, &source);
        }

        let markdown = render_markdown(&report);
        Ok(AnalysisOutput::new(report).with_artifact(UBOOT_VERSION_MD, markdown))
    }
}
