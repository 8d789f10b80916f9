//! Pulling data out of a firmware image: embedded gzip streams, printable
//! strings, and the binwalk extraction tree.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::bufread::GzDecoder;
use tracing::{debug, info};

pub use crate::config::GzipStrategy;
use crate::tools::{Tool, ToolError, ToolSet};

/// Decompress the gzip stream starting at `offset` in `firmware`.
///
/// `length` bounds the byte range; `None` reads to the end of the image.
/// Returns `None` on any failure: callers treat that as "not found".
pub fn extract_gzip_at_offset(
    tools: &ToolSet,
    firmware: &Path,
    offset: u64,
    length: Option<u64>,
    strategy: GzipStrategy,
) -> Option<Vec<u8>> {
    let result = match strategy {
        GzipStrategy::Pipeline => gunzip_pipeline(tools, firmware, offset, length),
        GzipStrategy::Strict => gunzip_strict(firmware, offset, length),
    };
    match result {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => {
            debug!(offset, ?strategy, "gzip extraction produced no data");
            None
        }
        Err(reason) => {
            debug!(offset, ?strategy, %reason, "gzip extraction failed");
            None
        }
    }
}

/// `dd | gunzip -c`: keeps whatever gunzip produced even if it complains
/// about trailing garbage after the stream.
fn gunzip_pipeline(
    tools: &ToolSet,
    firmware: &Path,
    offset: u64,
    length: Option<u64>,
) -> Result<Vec<u8>, String> {
    let mut dd = tools.command(Tool::Dd);
    dd.arg(format!("if={}", firmware.display()))
        .arg("bs=4096")
        .arg(format!("skip={offset}"))
        .arg("status=none");
    match length {
        Some(len) => {
            dd.arg("iflag=skip_bytes,count_bytes").arg(format!("count={len}"));
        }
        None => {
            dd.arg("iflag=skip_bytes");
        }
    }
    let mut dd_child = dd
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| tools.spawn_error(Tool::Dd, e).to_string())?;
    let Some(dd_out) = dd_child.stdout.take() else {
        let _ = dd_child.kill();
        let _ = dd_child.wait();
        return Err("dd stdout unavailable".to_string());
    };

    let spawned = tools
        .command(Tool::Gunzip)
        .arg("-c")
        .stdin(Stdio::from(dd_out))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let gunzip = match spawned {
        Ok(child) => child,
        Err(e) => {
            let _ = dd_child.kill();
            let _ = dd_child.wait();
            return Err(tools.spawn_error(Tool::Gunzip, e).to_string());
        }
    };
    let output = gunzip.wait_with_output().map_err(|e| e.to_string())?;
    // dd may see a broken pipe once gunzip stops reading; its status is irrelevant.
    let _ = dd_child.wait();

    if !output.status.success() {
        debug!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "gunzip exited non-zero; keeping partial output"
        );
    }
    Ok(output.stdout)
}

/// In-process decode of exactly one gzip member; trailing bytes are an error.
fn gunzip_strict(firmware: &Path, offset: u64, length: Option<u64>) -> Result<Vec<u8>, String> {
    let data = read_range(firmware, offset, length).map_err(|e| e.to_string())?;
    let mut decoder = GzDecoder::new(&data[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| e.to_string())?;
    let rest = decoder.into_inner();
    if !rest.is_empty() {
        return Err(format!("{} trailing bytes after gzip stream", rest.len()));
    }
    Ok(out)
}

/// Read `length` bytes (or everything) from `offset`.
pub fn read_range(path: &Path, offset: u64, length: Option<u64>) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    match length {
        Some(len) => {
            file.take(len).read_to_end(&mut data)?;
        }
        None => {
            file.read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

/// Runs of printable ASCII (space..tilde, plus tab) at least `min_len` long.
pub fn scan_printable_strings(data: &[u8], min_len: usize) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = Vec::new();
    for &b in data {
        if b == b'\t' || (0x20..=0x7e).contains(&b) {
            current.push(b);
            continue;
        }
        if current.len() >= min_len {
            found.push(String::from_utf8_lossy(&current).to_string());
        }
        current.clear();
    }
    if current.len() >= min_len {
        found.push(String::from_utf8_lossy(&current).to_string());
    }
    found
}

/// Candidate extraction directory names binwalk may have produced.
pub fn extraction_dir_candidates(firmware: &Path, extractions_dir: &Path) -> Vec<PathBuf> {
    let name = firmware.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    vec![
        extractions_dir.join(format!("{name}.extracted")),
        extractions_dir.join(format!("_{name}.extracted")),
    ]
}

/// Ensure `binwalk -e` output exists for `firmware`.
///
/// An existing `<file>.extracted` directory is trusted as-is; nothing checks
/// that its contents match the image.
pub fn ensure_extracted(
    tools: &ToolSet,
    firmware: &Path,
    extractions_dir: &Path,
) -> Result<PathBuf, ToolError> {
    let candidates = extraction_dir_candidates(firmware, extractions_dir);
    if let Some(existing) = candidates.iter().find(|p| p.is_dir()) {
        debug!(dir = %existing.display(), "reusing existing extraction");
        return Ok(existing.clone());
    }

    fs::create_dir_all(extractions_dir)
        .map_err(|source| ToolError::Workspace { path: extractions_dir.to_path_buf(), source })?;
    info!(firmware = %firmware.display(), "extracting firmware with binwalk");
    tools.binwalk_extract(firmware, extractions_dir)?;

    Ok(candidates.iter().find(|p| p.is_dir()).cloned().unwrap_or_else(|| candidates[0].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn strict_strategy_decodes_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("fw.img");
        let stream = gzip(b"U-Boot 2017.09 (Aug 01 2024)");
        let mut image = vec![0xAAu8; 64];
        image.extend_from_slice(&stream);
        fs::write(&fw, &image).unwrap();

        let out = extract_gzip_at_offset(
            &ToolSet::default(),
            &fw,
            64,
            Some(stream.len() as u64),
            GzipStrategy::Strict,
        );
        assert_eq!(out.as_deref(), Some(&b"U-Boot 2017.09 (Aug 01 2024)"[..]));
    }

    #[test]
    fn strict_strategy_rejects_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("fw.img");
        let mut image = gzip(b"payload");
        image.extend_from_slice(b"trailing garbage");
        fs::write(&fw, &image).unwrap();

        let out = extract_gzip_at_offset(&ToolSet::default(), &fw, 0, None, GzipStrategy::Strict);
        assert!(out.is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pipeline_strategy_keeps_payload_before_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("fw.img");
        let mut image = vec![0xAAu8; 64];
        image.extend_from_slice(&gzip(b"OP-TEE version: 3.13.0"));
        image.extend_from_slice(b"trailing garbage");
        fs::write(&fw, &image).unwrap();

        let out =
            extract_gzip_at_offset(&ToolSet::default(), &fw, 64, None, GzipStrategy::Pipeline);
        assert_eq!(out.as_deref(), Some(&b"OP-TEE version: 3.13.0"[..]));
    }

    #[cfg(unix)]
    #[test]
    fn pipeline_without_gunzip_is_none() {
        use crate::config::ToolPaths;

        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("fw.img");
        fs::write(&fw, gzip(b"payload")).unwrap();
        let tools = ToolSet::new(ToolPaths {
            gunzip: dir.path().join("missing-gunzip"),
            ..ToolPaths::default()
        });

        let out = extract_gzip_at_offset(&tools, &fw, 0, None, GzipStrategy::Pipeline);
        assert!(out.is_none());
    }

    #[test]
    fn printable_scan_splits_on_binary() {
        let data = b"\x00\x01hello\x00ab\x00world!\xff";
        assert_eq!(scan_printable_strings(data, 4), vec!["hello", "world!"]);
    }
}
