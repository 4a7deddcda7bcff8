//! Directory traversal for snapshotting the world tree.
//!
//! Every regular file under the root is reported with its root-relative path
//! (always `/`-separated), size and modification time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names skipped wherever they appear (exact match)
    pub excluded_names: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(names: &[String]) -> Self {
        Self {
            follow_links: false,
            excluded_names: names.to_vec(),
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = relative_key(path.strip_prefix(root).unwrap_or(&path));

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

/// Walk a directory tree and collect all files
///
/// # Example
/// ```no_run
/// use diffbackup::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("server/world"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    walk_directory_with_callback(root, options, |file| files.push(file))?;

    Ok(files)
}

/// Walk a directory tree with a callback for each file
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(FileInfo),
{
    let walker = WalkDir::new(root).follow_links(options.follow_links);

    for entry in walker {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        if should_exclude(&entry, &options.excluded_names) {
            continue;
        }

        callback(FileInfo::from_entry(&entry, root)?);
    }

    Ok(())
}

/// `/`-joined form of a relative path, used as the key in snapshots
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| *name == file_name)
}
