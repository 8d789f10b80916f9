//! Canonical firmware offsets and the shell-sourceable file that carries them.
//!
//! The binwalk analyzer writes `binwalk-offsets.sh` once per run; every other
//! analyzer reads it back through [`OffsetManager`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::layout::OFFSETS_FILE;

/// Fixed vocabulary of offset names, in boot-chain order.
pub const OFFSET_NAMES: [&str; 6] =
    ["BOOTLOADER_FIT", "UBOOT_GZ", "OPTEE_GZ", "KERNEL_FIT", "ROOTFS_CPIO", "SQUASHFS"];

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("No offsets location given (need an output directory or an explicit path)")]
    NoLocation,
    #[error("Offsets file not found at {0} (run `fwprobe binwalk` first)")]
    NotFound(PathBuf),
    #[error("Failed to read offsets file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid decimal value for {key}: {value:?}")]
    InvalidDecimal { key: String, value: String },
}

/// A single parsed value from the offsets file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetValue {
    /// Any key not ending in `_DEC`, kept verbatim.
    Raw(String),
    /// Keys ending in `_DEC`.
    Dec(u64),
}

impl OffsetValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OffsetValue::Raw(s) => Some(s),
            OffsetValue::Dec(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            OffsetValue::Dec(n) => Some(*n),
            OffsetValue::Raw(_) => None,
        }
    }
}

impl fmt::Display for OffsetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetValue::Raw(s) => f.write_str(s),
            OffsetValue::Dec(n) => write!(f, "{n}"),
        }
    }
}

/// Read-only view over a loaded offsets file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetManager {
    values: BTreeMap<String, OffsetValue>,
    source: Option<PathBuf>,
}

impl OffsetManager {
    /// Load offsets from `path`, or from `<output_dir>/binwalk-offsets.sh`.
    pub fn load_from_shell_script(
        output_dir: Option<&Path>,
        path: Option<&Path>,
    ) -> Result<Self, OffsetError> {
        let path = match (path, output_dir) {
            (Some(p), _) => p.to_path_buf(),
            (None, Some(dir)) => dir.join(OFFSETS_FILE),
            (None, None) => return Err(OffsetError::NoLocation),
        };
        if !path.is_file() {
            return Err(OffsetError::NotFound(path));
        }
        let body = fs::read_to_string(&path)
            .map_err(|source| OffsetError::Read { path: path.clone(), source })?;
        let mut manager = Self::parse(&body)?;
        manager.source = Some(path);
        Ok(manager)
    }

    /// Parse `KEY=value` lines; blank lines and `#` comments are skipped.
    pub fn parse(body: &str) -> Result<Self, OffsetError> {
        let mut values = BTreeMap::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let value = strip_quotes(value.trim());
            let parsed = if key.ends_with("_DEC") {
                let n = value.parse::<u64>().map_err(|_| OffsetError::InvalidDecimal {
                    key: key.clone(),
                    value: value.to_string(),
                })?;
                OffsetValue::Dec(n)
            } else {
                OffsetValue::Raw(value.to_string())
            };
            values.insert(key, parsed);
        }
        Ok(Self { values, source: None })
    }

    pub fn get(&self, key: &str) -> Option<&OffsetValue> {
        self.values.get(key)
    }

    /// `<name>_OFFSET`, only when stored as a string.
    pub fn get_hex(&self, name: &str) -> Option<&str> {
        self.values.get(&format!("{name}_OFFSET")).and_then(OffsetValue::as_str)
    }

    /// `<name>_OFFSET_DEC`, only when stored as an integer.
    pub fn get_dec(&self, name: &str) -> Option<u64> {
        self.values.get(&format!("{name}_OFFSET_DEC")).and_then(OffsetValue::as_u64)
    }

    /// Resolve an offset by name, preferring the decimal twin and falling back
    /// to parsing the hex string.
    pub fn offset(&self, name: &str) -> Option<u64> {
        self.get_dec(name).or_else(|| self.get_hex(name).and_then(parse_hex))
    }

    /// `SQUASHFS_SIZE` accepts either a plain integer or a hex string.
    pub fn squashfs_size(&self) -> Option<u64> {
        match self.values.get("SQUASHFS_SIZE")? {
            OffsetValue::Dec(n) => Some(*n),
            OffsetValue::Raw(s) => s.parse().ok().or_else(|| parse_hex(s)),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Where these offsets were loaded from, if they came from disk.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl Index<&str> for OffsetManager {
    type Output = OffsetValue;

    fn index(&self, key: &str) -> &OffsetValue {
        match self.values.get(key) {
            Some(v) => v,
            None => panic!("offset key not present: {key}"),
        }
    }
}

/// Writer side: the offsets discovered in one binwalk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetSet {
    entries: Vec<(String, u64)>,
    squashfs_size: Option<u64>,
}

impl OffsetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an offset; a second insert under the same name replaces the first.
    pub fn insert(&mut self, name: impl Into<String>, offset: u64) -> &mut Self {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = offset,
            None => self.entries.push((name, offset)),
        }
        self
    }

    pub fn set_squashfs_size(&mut self, size: Option<u64>) -> &mut Self {
        self.squashfs_size = size;
        self
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn squashfs_size(&self) -> Option<u64> {
        self.squashfs_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Render the shell-sourceable artifact: `NAME_OFFSET=0x…` and
    /// `NAME_OFFSET_DEC=<int>`, one blank line between groups.
    pub fn to_shell_script(&self, firmware_name: &str) -> String {
        let mut out = String::new();
        out.push_str("#!/bin/sh\n");
        out.push_str("# Firmware offsets generated by fwprobe binwalk\n");
        out.push_str(&format!("# Firmware: {firmware_name}\n"));
        for (name, offset) in &self.entries {
            out.push('\n');
            out.push_str(&format!("{name}_OFFSET={}\n", format_hex(*offset)));
            out.push_str(&format!("{name}_OFFSET_DEC={offset}\n"));
        }
        if let Some(size) = self.squashfs_size {
            out.push('\n');
            out.push_str(&format!("SQUASHFS_SIZE={size}\n"));
        }
        out
    }
}

/// `0x` prefix followed by uppercase hex digits, as binwalk prints them.
pub fn format_hex(value: u64) -> String {
    format!("0x{value:X}")
}

/// Parse `0x1E240` / `1e240` style hex strings.
pub fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).ok()
}

fn strip_quotes(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
