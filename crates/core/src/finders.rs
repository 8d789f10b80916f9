//! Directory-walking file search used by the rootfs-oriented analyzers.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::{DirEntry, WalkDir};

/// Directory names binwalk derives from an offset.
static HEX_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]+$").expect("static regex"));
static EMPTY_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new("^$").expect("static regex"));

/// Which filesystem entry types a query accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryKind {
    #[default]
    Any,
    File,
    Dir,
    Symlink,
}

/// Glob-style include/exclude query over file names.
///
/// Patterns support `*` and `?` and match the entry's file name. An entry is
/// returned when it matches at least one include pattern (or there are
/// none), no exclude pattern, and the kind filter.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    kind: EntryKind,
    max_depth: Option<usize>,
}

impl FileQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.include.push(glob_to_regex(pattern));
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.exclude.push(glob_to_regex(pattern));
        self
    }

    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    fn matches(&self, entry: &DirEntry) -> bool {
        let file_type = entry.file_type();
        let kind_ok = match self.kind {
            EntryKind::Any => true,
            EntryKind::File => file_type.is_file(),
            EntryKind::Dir => file_type.is_dir(),
            EntryKind::Symlink => file_type.is_symlink(),
        };
        if !kind_ok {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(&name));
        included && !self.exclude.iter().any(|re| re.is_match(&name))
    }

    /// Walk `root` (sorted, symlinks not followed) and return matching paths.
    pub fn find(&self, root: &Path) -> Vec<PathBuf> {
        let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
        if let Some(depth) = self.max_depth {
            walker = walker.max_depth(depth);
        }
        walker
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| self.matches(e))
            .map(|e| e.into_path())
            .collect()
    }

    pub fn find_first(&self, root: &Path) -> Option<PathBuf> {
        let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
        if let Some(depth) = self.max_depth {
            walker = walker.max_depth(depth);
        }
        walker.into_iter().filter_map(Result::ok).find(|e| self.matches(e)).map(|e| e.into_path())
    }
}

/// Translate `*` / `?` globs into an anchored regex.
fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    // Every metacharacter was escaped above, so the pattern always compiles.
    Regex::new(&re).unwrap_or_else(|_| EMPTY_NAME.clone())
}

/// First directory literally named `squashfs-root` under the extraction.
pub fn find_squashfs_root(extraction_dir: &Path) -> Option<PathBuf> {
    FileQuery::new().include("squashfs-root").kind(EntryKind::Dir).find_first(extraction_dir)
}

/// Directory name binwalk uses for content found at `offset`: uppercase hex
/// without a prefix (585140 -> `8EDB4`).
pub fn offset_dir_name(offset: u64) -> String {
    format!("{offset:X}")
}

/// The directory binwalk extracted the device tree at decimal `offset` into.
pub fn find_device_tree_dir(extraction_dir: &Path, offset: u64) -> Option<PathBuf> {
    let name = offset_dir_name(offset);
    FileQuery::new().include(&name).kind(EntryKind::Dir).find_first(extraction_dir)
}

/// Every all-hex directory under the extraction that holds a `.dts` or `.dtb`.
pub fn device_tree_dirs(extraction_dir: &Path) -> Vec<PathBuf> {
    FileQuery::new()
        .kind(EntryKind::Dir)
        .find(extraction_dir)
        .into_iter()
        .filter(|dir| {
            dir.file_name().map(|n| HEX_DIR.is_match(&n.to_string_lossy())).unwrap_or(false)
        })
        .filter(|dir| !device_tree_files(dir).is_empty())
        .collect()
}

/// `.dts` files directly inside `dir`, falling back to `.dtb` files.
pub fn device_tree_files(dir: &Path) -> Vec<PathBuf> {
    let dts = FileQuery::new().include("*.dts").kind(EntryKind::File).max_depth(1).find(dir);
    if !dts.is_empty() {
        return dts;
    }
    FileQuery::new().include("*.dtb").kind(EntryKind::File).max_depth(1).find(dir)
}
