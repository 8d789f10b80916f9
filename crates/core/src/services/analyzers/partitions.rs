//! Flash layout derived purely from the offsets file.

use serde::Serialize;
use serde_json::Value;

use crate::offsets::{format_hex, OffsetManager};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

const MIB: u64 = 1024 * 1024;

/// Image regions in layout order: (offset name, region, type, content).
const REGIONS: [(&str, &str, &str, &str); 4] = [
    ("BOOTLOADER_FIT", "Bootloader FIT", "FIT", "U-Boot + OP-TEE"),
    ("KERNEL_FIT", "Kernel FIT", "FIT", "Linux kernel + device tree"),
    ("ROOTFS_CPIO", "Initramfs", "cpio", "Initial ramdisk"),
    ("SQUASHFS", "Root FS", "SquashFS", "Main filesystem"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub region: String,
    pub offset: String,
    pub size_mb: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub partitions: Vec<Partition>,
    #[serde(skip)]
    meta: Provenance,
}

impl PartitionAnalysis {
    pub fn new(firmware_file: impl Into<String>, firmware_size: u64) -> Self {
        Self { firmware_file: firmware_file.into(), firmware_size, ..Self::default() }
    }
}

impl Report for PartitionAnalysis {
    fn title(&self) -> &str {
        "Firmware Partition Layout"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Append one partition per region present in `offsets`.
///
/// The SquashFS region uses `SQUASHFS_SIZE` when known; every other region
/// runs to the next present offset or to the end of the image. Sizes are whole
/// MiB, rounded down.
pub fn analyze_partitions(analysis: &mut PartitionAnalysis, offsets: &OffsetManager) {
    let present: Vec<(usize, u64)> = REGIONS
        .iter()
        .enumerate()
        .filter_map(|(idx, (name, ..))| offsets.offset(name).map(|off| (idx, off)))
        .collect();

    for (pos, &(idx, offset)) in present.iter().enumerate() {
        let (name, region, kind, content) = REGIONS[idx];
        let squashfs_size = if name == "SQUASHFS" { offsets.squashfs_size() } else { None };
        let size = squashfs_size.unwrap_or_else(|| {
            let end = present.get(pos + 1).map_or(analysis.firmware_size, |&(_, next)| next);
            end.saturating_sub(offset)
        });
        analysis.partitions.push(Partition {
            region: region.to_string(),
            offset: format_hex(offset),
            size_mb: size / MIB,
            kind: kind.to_string(),
            content: content.to_string(),
        });
    }
    if !analysis.partitions.is_empty() {
        let source = offsets
            .source()
            .map_or_else(|| "binwalk-offsets.sh".to_string(), |p| p.display().to_string());
        analysis.meta.add_metadata(
            "partitions",
            source,
            "Region starts from *_OFFSET; sizes run to the next region or SQUASHFS_SIZE",
        );
    }
}

pub struct PartitionsAnalyzer;

impl TopicAnalyzer for PartitionsAnalyzer {
    fn name(&self) -> &'static str {
        "partitions"
    }

    fn description(&self) -> &'static str {
        "Flash layout (region offsets and sizes) from binwalk-offsets.sh"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: false, offsets: true }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let offsets = ctx.offsets(self.name())?;
        let mut report = PartitionAnalysis::new(&ctx.firmware.file_name, ctx.firmware.size);
        report.meta.add_metadata("firmware_size", ctx.firmware_label(), "File size on disk");
        analyze_partitions(&mut report, offsets);
        Ok(AnalysisOutput::new(report))
    }
}
