//! Directory traversal for archive sources.
//!
//! Walks a source directory in a stable order and reports every file,
//! directory and symlink below it, honouring exclusion patterns.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directory names that are never worth archiving.
pub const ALWAYS_EXCLUDED: &[&str] = &["__pycache__"];

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Exclude patterns matched against the entry's file name.
    ///
    /// `name` matches exactly, `*suffix` and `prefix*` match by suffix/prefix.
    /// An excluded directory is skipped together with its contents.
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_patterns: ALWAYS_EXCLUDED.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl WalkOptions {
    /// Default options plus additional exclusion patterns.
    pub fn excluding<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = Self::default();
        options.exclude_patterns.extend(patterns.into_iter().map(Into::into));
        options
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,

    pub is_dir: bool,

    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = entry.path_is_symlink() && !metadata.is_dir();
        let is_dir = metadata.is_dir();
        let size = if is_dir || is_symlink { 0 } else { metadata.len() };

        Ok(Self {
            path,
            relative_path,
            size,
            is_dir,
            is_symlink,
        })
    }
}

/// Walk a directory tree and collect every entry below `root`.
///
/// The root itself is not reported. Entries are sorted by file name at each
/// level so archives built from the same tree are laid out identically.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    walk_directory_with_callback(root, options, |info| entries.push(info.clone()))?;
    Ok(entries)
}

/// Walk a directory tree with a callback for each entry.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, &options.exclude_patterns));

    for entry in walker {
        let entry = entry?;
        let info = FileInfo::from_entry(&entry, root)?;
        callback(&info);
    }

    Ok(())
}

/// Calculate total size of all files in a directory
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    let mut total_size = 0u64;

    walk_directory_with_callback(root, options, |file| {
        total_size += file.size;
    })?;

    Ok(total_size)
}

/// Whether `name` is one of the entries no backup ever captures.
pub fn is_always_excluded(name: &str) -> bool {
    ALWAYS_EXCLUDED.iter().any(|pattern| matches_pattern(name, pattern))
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| matches_pattern(&file_name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        name == pattern
    }
}
