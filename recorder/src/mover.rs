//! Eviction actions: archive a hot file, or delete an archived one.
//!
//! A moved file's source is removed only after every byte has reached the
//! destination and the destination has been flushed to disk.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use tracing::{debug, info};

/// How an eviction was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evicted {
    /// Atomic rename within one filesystem.
    Renamed,
    /// Byte copy to another filesystem, then unlink.
    Copied,
    Deleted,
    /// The file was already gone.
    Missing,
}

/// Move `src` into `archive_dir`, keeping its file name.
pub fn move_to_archive(src: &Path, archive_dir: &Path) -> io::Result<Evicted> {
    archive_with(src, archive_dir, |from, to| fs::rename(from, to))
}

fn archive_with<R>(src: &Path, archive_dir: &Path, rename: R) -> io::Result<Evicted>
where
    R: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", src.display()),
        )
    })?;
    let target = archive_dir.join(name);

    match rename(src, &target) {
        Ok(()) => {
            debug!("Renamed {} → {}", src.display(), target.display());
            Ok(Evicted::Renamed)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound && !src.exists() => Ok(Evicted::Missing),
        Err(e) if is_cross_device(&e) => match copy_then_remove(src, &target) {
            Ok(bytes) => {
                info!(
                    "Copied {} → {} across filesystems ({bytes} bytes)",
                    src.display(),
                    target.display()
                );
                Ok(Evicted::Copied)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !src.exists() => {
                Ok(Evicted::Missing)
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Remove `path`; a file that is already gone is not an error.
pub fn delete(path: &Path) -> io::Result<Evicted> {
    match fs::remove_file(path) {
        Ok(()) => Ok(Evicted::Deleted),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Evicted::Missing),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Copy `src` to `dst` byte for byte, then remove `src`.
pub fn copy_then_remove(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut input = File::open(src)?;
    let expected = input.metadata()?.len();
    let copied = write_copy(&mut input, dst, expected)?;
    drop(input);
    fs::remove_file(src)?;
    Ok(copied)
}

/// Stream `input` into a new file at `dst`, requiring exactly `expected`
/// bytes.  On any failure the partial destination is removed.
fn write_copy(input: &mut impl Read, dst: &Path, expected: u64) -> io::Result<u64> {
    let mut output = File::create(dst)?;
    let result = io::copy(input, &mut output).and_then(|copied| {
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short transfer to {}: {copied} of {expected} bytes", dst.display()),
            ));
        }
        output.sync_all()?;
        Ok(copied)
    });
    drop(output);
    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}
