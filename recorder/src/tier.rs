//! Storage tiers – a directory, its watermarks, and a view of its files.

#[cfg(unix)]
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use nvr_common::config::Watermarks;

/// One file inside a tier, as seen by the last directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub name: String,
    pub path: PathBuf,
    /// Creation (inode change) time, seconds since the epoch.
    pub created: i64,
}

/// Filesystem usage in blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub free: u64,
    pub total: u64,
}

impl Usage {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total - self.free.min(self.total)) as f64 * 100.0 / self.total as f64
    }
}

/// Source of filesystem usage figures.
pub trait SpaceProbe: Send {
    fn usage(&self, path: &Path) -> io::Result<Usage>;
}

/// `statvfs(3)` on the tier directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statvfs;

impl SpaceProbe for Statvfs {
    #[cfg(unix)]
    fn usage(&self, path: &Path) -> io::Result<Usage> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut st = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
        let r = unsafe { libc::statvfs(c_path.as_ptr(), st.as_mut_ptr()) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        let st = unsafe { st.assume_init() };
        Ok(Usage {
            free: st.f_bfree as u64,
            total: st.f_blocks as u64,
        })
    }

    #[cfg(not(unix))]
    fn usage(&self, path: &Path) -> io::Result<Usage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no filesystem statistics for {}", path.display()),
        ))
    }
}

/// What happens to the oldest file of a tier under pressure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// Move into another tier's directory.
    Archive { target: PathBuf },
    /// Remove for good.
    Delete,
}

#[derive(Debug, Clone)]
pub struct Tier {
    pub name: String,
    pub path: PathBuf,
    pub watermarks: Watermarks,
    pub eviction: Eviction,
}

impl Tier {
    pub fn new(name: &str, path: PathBuf, watermarks: Watermarks, eviction: Eviction) -> Self {
        Self {
            name: name.to_string(),
            path,
            watermarks,
            eviction,
        }
    }
}

/// Create a tier root if it does not exist yet.  Safe to call repeatedly.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Scan `dir` for regular, non-hidden files, newest first.
pub fn scan_entries(dir: &Path) -> io::Result<Vec<StorageEntry>> {
    let mut entries = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        let meta = match dir_entry.metadata() {
            Ok(m) => m,
            // Removed between readdir and stat.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !meta.is_file() {
            continue;
        }
        entries.push(StorageEntry {
            name,
            path: dir_entry.path(),
            created: created_secs(&meta),
        });
    }
    sort_newest_first(&mut entries);
    Ok(entries)
}

#[cfg(unix)]
fn created_secs(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
}

#[cfg(not(unix))]
fn created_secs(meta: &std::fs::Metadata) -> i64 {
    meta.created()
        .or_else(|_| meta.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Order newest first, so the oldest entry is at the back.  Equal times
/// fall back to the name, keeping the lexically smallest name last.
pub fn sort_newest_first(entries: &mut [StorageEntry]) {
    entries.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| b.name.cmp(&a.name))
    });
}

/// Modification time of `meta` as seconds since the epoch.
pub fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
