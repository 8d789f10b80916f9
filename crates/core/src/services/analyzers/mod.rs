//! Built-in topic analyzers, one module per report.

pub mod binwalk;
pub mod boot_process;
pub mod device_trees;
pub mod network_services;
pub mod partitions;
pub mod proprietary_blobs;
pub mod rootfs;
pub mod secure_boot;
pub mod uboot;

mod markdown;

pub use binwalk::BinwalkAnalyzer;
pub use boot_process::BootProcessAnalyzer;
pub use device_trees::DeviceTreesAnalyzer;
pub use network_services::NetworkServicesAnalyzer;
pub use partitions::PartitionsAnalyzer;
pub use proprietary_blobs::ProprietaryBlobsAnalyzer;
pub use rootfs::RootfsAnalyzer;
pub use secure_boot::SecureBootAnalyzer;
pub use uboot::UBootAnalyzer;

use std::path::Path;

use tracing::debug;

use crate::extraction::{extract_gzip_at_offset, scan_printable_strings};
use crate::offsets::OFFSET_NAMES;
use crate::services::analysis::AnalysisContext;

/// `path` relative to `root`, as a display string; falls back to the full path.
pub(crate) fn relative_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// First capture group of `re` over `lines`, in order.
pub(crate) fn first_capture(re: &regex::Regex, lines: &[String]) -> Option<String> {
    lines.iter().find_map(|l| re.captures(l).map(|c| c[1].trim().to_string()))
}

/// Decompress the gzip stream recorded under offset `name`.
///
/// The byte range ends at the next known offset, or at the end of the image.
pub(crate) fn gzip_payload(ctx: &AnalysisContext, name: &str) -> Option<Vec<u8>> {
    let offsets = ctx.offsets.as_ref()?;
    let start = offsets.offset(name)?;
    let end = OFFSET_NAMES.iter().filter_map(|n| offsets.offset(n)).filter(|&o| o > start).min();
    let length = end.map(|e| e - start);
    let data = extract_gzip_at_offset(
        &ctx.tools,
        &ctx.firmware.path,
        start,
        length,
        ctx.config.gzip_strategy,
    );
    if data.is_none() {
        debug!(offset = name, start, "no gzip payload recovered");
    }
    data
}

/// Printable strings of the payload at offset `name`; empty when absent.
pub(crate) fn gzip_payload_strings(ctx: &AnalysisContext, name: &str) -> Vec<String> {
    gzip_payload(ctx, name)
        .map(|data| scan_printable_strings(&data, ctx.config.min_string_length))
        .unwrap_or_default()
}
