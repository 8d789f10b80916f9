//! Signature scan of the whole image and the canonical offsets file.
//!
//! Offsets are picked by substring queries over binwalk's description column,
//! taking the first matching row in output order. That heuristic assumes one
//! specific image layout, so every query that matches more than one row is
//! logged and listed in `offset_warnings` instead of being trusted silently.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::firmware::FirmwareImage;
use crate::layout::OFFSETS_FILE;
use crate::offsets::{format_hex, OffsetSet};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

static ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(\S+)\s+(.*\S)\s*$").expect("static regex")
});
static IMAGE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"image size:\s*(\d+)").expect("static regex"));

/// One row of binwalk's signature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    pub offset: String,
    pub offset_dec: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/// Keep only rows that start with a decimal offset whose second column is a
/// `0x` hex offset; headers, separators and continuation lines are dropped.
pub fn parse_binwalk_output(text: &str) -> Vec<Component> {
    text.lines()
        .filter_map(|line| {
            let caps = ROW.captures(line)?;
            let hex = &caps[2];
            if !hex.starts_with("0x") {
                return None;
            }
            let offset_dec = caps[1].parse().ok()?;
            let description = caps[3].to_string();
            let kind = description.split_whitespace().next().unwrap_or_default().to_string();
            Some(Component { offset: hex.to_string(), offset_dec, kind, description })
        })
        .collect()
}

/// A query for one named offset: every term must appear (case-insensitive).
#[derive(Debug, Clone, Copy)]
pub struct OffsetQuery {
    pub name: &'static str,
    pub terms: &'static [&'static str],
    /// Only consider rows past the largest of these already-resolved offsets.
    pub after: &'static [&'static str],
}

/// Queries for the GL.iNet RM-series layout, in boot-chain order.
pub const OFFSET_QUERIES: [OffsetQuery; 6] = [
    OffsetQuery { name: "BOOTLOADER_FIT", terms: &["device tree blob"], after: &[] },
    OffsetQuery {
        name: "UBOOT_GZ",
        terms: &["gzip compressed data", "u-boot"],
        after: &["BOOTLOADER_FIT"],
    },
    OffsetQuery {
        name: "OPTEE_GZ",
        terms: &["gzip compressed data", "tee"],
        after: &["BOOTLOADER_FIT"],
    },
    OffsetQuery {
        name: "KERNEL_FIT",
        terms: &["device tree blob"],
        after: &["BOOTLOADER_FIT", "UBOOT_GZ", "OPTEE_GZ"],
    },
    OffsetQuery { name: "ROOTFS_CPIO", terms: &["cpio archive"], after: &["KERNEL_FIT"] },
    OffsetQuery { name: "SQUASHFS", terms: &["squashfs"], after: &[] },
];

/// Result of matching one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetMatch<'a> {
    pub component: &'a Component,
    /// How many rows matched; anything above one means the pick is ambiguous.
    pub candidates: usize,
}

fn matches_terms(component: &Component, terms: &[&str]) -> bool {
    let description = component.description.to_lowercase();
    terms.iter().all(|t| description.contains(&t.to_lowercase()))
}

/// First row (in output order) whose description contains every term.
pub fn extract_offset_from_lines(components: &[Component], terms: &[&str]) -> Option<u64> {
    components.iter().find(|c| matches_terms(c, terms)).map(|c| c.offset_dec)
}

/// Like [`extract_offset_from_lines`], restricted to rows past `min_offset`,
/// and reporting how many rows were candidates.
pub fn find_offset<'a>(
    components: &'a [Component],
    terms: &[&str],
    min_offset: Option<u64>,
) -> Option<OffsetMatch<'a>> {
    let mut candidates = components
        .iter()
        .filter(|c| min_offset.map_or(true, |min| c.offset_dec > min))
        .filter(|c| matches_terms(c, terms));
    let component = candidates.next()?;
    Some(OffsetMatch { component, candidates: 1 + candidates.count() })
}

/// Run every query in order and collect the offsets plus ambiguity warnings.
pub fn resolve_offsets(components: &[Component]) -> (OffsetSet, Vec<String>) {
    let mut offsets = OffsetSet::new();
    let mut warnings = Vec::new();
    for query in OFFSET_QUERIES {
        let min_offset = query.after.iter().filter_map(|name| offsets.get(name)).max();
        let Some(found) = find_offset(components, query.terms, min_offset) else {
            continue;
        };
        if found.candidates > 1 {
            let message = format!(
                "{}: {} rows matched {:?}; using the first at {}",
                query.name, found.candidates, query.terms, found.component.offset
            );
            warn!(offset = query.name, candidates = found.candidates, "ambiguous offset match");
            warnings.push(message);
        }
        offsets.insert(query.name, found.component.offset_dec);
        if query.name == "SQUASHFS" {
            let size = IMAGE_SIZE
                .captures(&found.component.description)
                .and_then(|c| c[1].parse::<u64>().ok());
            offsets.set_squashfs_size(size);
        }
    }
    (offsets, warnings)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BinwalkAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub component_count: usize,
    pub bootloader_fit_offset: Option<String>,
    pub uboot_gz_offset: Option<String>,
    pub optee_gz_offset: Option<String>,
    pub kernel_fit_offset: Option<String>,
    pub rootfs_cpio_offset: Option<String>,
    pub squashfs_offset: Option<String>,
    pub squashfs_size: Option<u64>,
    pub offset_warnings: Vec<String>,
    pub components: Vec<Component>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for BinwalkAnalysis {
    fn title(&self) -> &str {
        "Binwalk Firmware Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Build the report and the offsets for an already-captured scan.
pub fn analyze_binwalk_text(firmware: &FirmwareImage, scan: &str) -> (BinwalkAnalysis, OffsetSet) {
    let source = firmware.path.display().to_string();
    let components = parse_binwalk_output(scan);
    let (offsets, offset_warnings) = resolve_offsets(&components);

    let mut report = BinwalkAnalysis {
        firmware_file: firmware.file_name.clone(),
        firmware_size: firmware.size,
        component_count: components.len(),
        offset_warnings,
        ..BinwalkAnalysis::default()
    };
    report.meta.add_metadata("firmware_size", &source, "File size on disk");
    report.meta.add_metadata("component_count", "binwalk", "Rows of the binwalk signature table");

    for query in OFFSET_QUERIES {
        let Some(offset) = offsets.get(query.name) else { continue };
        let hex = Some(format_hex(offset));
        let field = match query.name {
            "BOOTLOADER_FIT" => {
                report.bootloader_fit_offset = hex;
                "bootloader_fit_offset"
            }
            "UBOOT_GZ" => {
                report.uboot_gz_offset = hex;
                "uboot_gz_offset"
            }
            "OPTEE_GZ" => {
                report.optee_gz_offset = hex;
                "optee_gz_offset"
            }
            "KERNEL_FIT" => {
                report.kernel_fit_offset = hex;
                "kernel_fit_offset"
            }
            "ROOTFS_CPIO" => {
                report.rootfs_cpio_offset = hex;
                "rootfs_cpio_offset"
            }
            _ => {
                report.squashfs_offset = hex;
                "squashfs_offset"
            }
        };
        report.meta.add_metadata(
            field,
            "binwalk",
            format!("First row matching {}", query.terms.join(" + ")),
        );
    }
    if let Some(size) = offsets.squashfs_size() {
        report.squashfs_size = Some(size);
        report.meta.add_metadata("squashfs_size", "binwalk", "image size: field of the SquashFS row");
    }
    report.components = components;
    (report, offsets)
}

pub struct BinwalkAnalyzer;

impl TopicAnalyzer for BinwalkAnalyzer {
    fn name(&self) -> &'static str {
        "binwalk"
    }

    fn description(&self) -> &'static str {
        "Signature scan; writes binwalk-offsets.sh for every other report"
    }

    fn requirements(&self) -> Requirements {
        Requirements::default()
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let scan = ctx.tools.binwalk_scan(&ctx.firmware.path)?;
        let (report, offsets) = analyze_binwalk_text(&ctx.firmware, &scan);
        let script = offsets.to_shell_script(&ctx.firmware.file_name);
        Ok(AnalysisOutput::new(report).with_artifact(OFFSETS_FILE, script))
    }
}
