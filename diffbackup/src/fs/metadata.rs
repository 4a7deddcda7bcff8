//! File-level helpers shared by backup, restore and merge.
//!
//! Copies keep the source modification time so a restored file compares
//! equal to the snapshot it was captured in.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Seconds since the Unix epoch as stored in snapshots
pub fn mtime_secs(time: SystemTime) -> f64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Copy `src` to `dst`, creating parent directories and carrying over the
/// modification time. Returns the number of bytes copied.
///
/// The copy lands in a sibling first and is renamed over `dst`, so `dst`
/// keeps its old content when `src` cannot be read.
pub fn copy_preserving_mtime(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let modified = fs::metadata(src)?.modified()?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = partial_path(dst)?;
    let copied = fs::copy(src, &tmp).and_then(|bytes| {
        fs::File::options().write(true).open(&tmp)?.set_modified(modified)?;
        fs::rename(&tmp, dst)?;
        Ok(bytes)
    });
    if copied.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    copied
}

fn partial_path(dst: &Path) -> std::io::Result<PathBuf> {
    let mut name = dst
        .file_name()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "copy target has no file name"))?
        .to_os_string();
    name.push(".partial");
    Ok(dst.with_file_name(name))
}

/// Write `bytes` to a temporary sibling and rename it over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Remove everything inside `dir` and leave it existing and empty
pub fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}
