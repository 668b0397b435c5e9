use std::{
    fs::File,
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, trace, warn};
use tar::{Archive, Entries, Entry, EntryType, Header};

use super::{
    parse_whiteout, relative_link_target, sanitize_entry_path,
    target::{Linker, Target},
    Compression, Whiteout,
};
use crate::{Error, Result};

/// 1910-01-01T00:00:00Z, as seconds before the epoch.
const MIN_TIMESTAMP_BEFORE_EPOCH: u64 = 1_893_456_000;
/// How far past the current time an entry's timestamp may lie.
const MAX_TIMESTAMP_SKEW: Duration = Duration::from_secs(7000);

/// Replaces implausible timestamps before they're applied to extracted files.
///
/// A modification time before 1910 or more than two hours in the future becomes `now`.  An
/// access time outside the same window (or missing) becomes the chosen modification time.
pub fn clamp_times(
    atime: Option<SystemTime>,
    mtime: SystemTime,
    now: SystemTime,
) -> (SystemTime, SystemTime) {
    let min = UNIX_EPOCH - Duration::from_secs(MIN_TIMESTAMP_BEFORE_EPOCH);
    let max = now + MAX_TIMESTAMP_SKEW;
    let in_range = |t: SystemTime| t >= min && t <= max;

    let mtime = if in_range(mtime) { mtime } else { now };
    let atime = match atime {
        Some(atime) if in_range(atime) => atime,
        _ => mtime,
    };
    (atime, mtime)
}

/// Decodes a timestamp field: octal, or GNU base-256 for values octal can't hold (including
/// times before the epoch).  `None` if the time isn't representable as a [`SystemTime`].
fn field_time(field: &[u8]) -> Result<Option<SystemTime>> {
    let secs = match field.first() {
        Some(&first) if first & 0x80 != 0 => {
            // two's complement over everything below the marker bit
            let mut value: i128 = if first & 0x40 != 0 { -1 } else { 0 };
            value = (value << 7) | i128::from(first & 0x7f);
            for &byte in &field[1..] {
                value = (value << 8) | i128::from(byte);
            }
            value
        }
        _ => {
            let text = String::from_utf8_lossy(field);
            let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
            if text.is_empty() {
                0
            } else {
                i128::from_str_radix(text, 8)
                    .map_err(|_| Error::Corrupt(format!("invalid timestamp field {text:?}")))?
            }
        }
    };
    let Ok(secs) = i64::try_from(secs) else {
        return Ok(None);
    };
    let magnitude = Duration::from_secs(secs.unsigned_abs());
    Ok(if secs >= 0 {
        UNIX_EPOCH.checked_add(magnitude)
    } else {
        UNIX_EPOCH.checked_sub(magnitude)
    })
}

fn header_times(header: &Header) -> Result<(Option<SystemTime>, Option<SystemTime>)> {
    let mtime = field_time(&header.as_old().mtime)?;
    let atime = header
        .as_gnu()
        .and_then(|gnu| field_time(&gnu.atime).ok().flatten())
        .filter(|&t| t != UNIX_EPOCH);
    Ok((atime, mtime))
}

/// Reads a (possibly compressed) tar stream and materializes it into a [`Target`].
pub struct ArchiveReader<'a> {
    archive: Archive<Box<dyn Read + 'a>>,
}

impl ArchiveReader<'static> {
    pub fn open(path: &Path, compression: Compression) -> Result<Self> {
        Self::new(File::open(path)?, compression)
    }
}

impl<'a> ArchiveReader<'a> {
    pub fn new<R: Read + 'a>(source: R, compression: Compression) -> Result<Self> {
        Ok(Self {
            archive: Archive::new(compression.decoder(source)?),
        })
    }

    /// Streams the raw entries: each item's header describes the entry and reading from it
    /// yields the payload.  An archive can only be walked once.
    pub fn entries(&mut self) -> Result<Entries<'_, Box<dyn Read + 'a>>> {
        Ok(self.archive.entries()?)
    }

    /// Applies every entry to `target` in archive order.
    ///
    /// Whiteouts delete what they name, directories are created (or reused) and regular files
    /// overwritten.  Symlinks are created after all other entries; hardlinks become relative
    /// symlinks to the entry they name.  Either kind of link replaces whatever is already at
    /// its path.  Directory modes, owners and times are applied last, deepest first, so a
    /// read-only directory can still be filled.  Device nodes are skipped.
    pub fn extract_tree_into<T: Target + ?Sized>(&mut self, target: &T) -> Result<()> {
        let now = SystemTime::now();
        let mut symlinks = vec![];
        let mut dirs = vec![];

        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let path = sanitize_entry_path(&entry.path()?)?;
            if path.as_os_str().is_empty() {
                continue;
            }

            if let Some(whiteout) = parse_whiteout(&path) {
                apply_whiteout(target, whiteout)?;
                io::copy(&mut entry, &mut io::sink())?;
                continue;
            }

            match entry.header().entry_type() {
                EntryType::Directory => {
                    unpack_dir(target, &path, entry.header())?;
                    dirs.push((path, entry.header().clone()));
                }
                EntryType::Regular | EntryType::Continuous => {
                    unpack_file(target, &path, &mut entry, now)?
                }
                EntryType::Symlink => symlinks.push((path, link_name(&entry)?)),
                EntryType::Link => {
                    let original = sanitize_entry_path(&link_name(&entry)?)?;
                    match target.linker() {
                        Some(linker) => {
                            ensure_parent(target, &path)?;
                            let link = relative_link_target(&path, &original);
                            replace_link(target, linker, &link, &path)?;
                        }
                        None => trace!("no linker, skipping hardlink {}", path.display()),
                    }
                }
                EntryType::Char | EntryType::Block => {
                    debug!("skipping device node {}", path.display());
                }
                other => debug!("skipping {other:?} entry {}", path.display()),
            }
        }

        match target.linker() {
            Some(linker) => {
                for (path, link) in symlinks {
                    ensure_parent(target, &path)?;
                    replace_link(target, linker, &link, &path)?;
                }
            }
            None if !symlinks.is_empty() => {
                debug!("no linker, skipping {} symlinks", symlinks.len());
            }
            None => {}
        }

        for (path, header) in dirs.iter().rev() {
            match finish_dir(target, path, header, now) {
                Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    trace!("{} was removed during extraction", path.display());
                }
                result => result?,
            }
        }
        Ok(())
    }
}

/// Creates the symlink `path -> link`.  If something is already at `path` it is removed and
/// the link retried once; a conflict that survives the retry is left in place.
fn replace_link<T: Target + ?Sized>(
    target: &T,
    linker: &dyn Linker,
    link: &Path,
    path: &Path,
) -> Result<()> {
    match linker.symlink(link, path) {
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        result => return Ok(result?),
    }
    match target.remove(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    match linker.symlink(link, path) {
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!("{} reappeared, keeping it", path.display());
            Ok(())
        }
        result => Ok(result?),
    }
}

fn link_name<R: Read>(entry: &Entry<'_, R>) -> Result<PathBuf> {
    match entry.link_name()? {
        Some(name) => Ok(name.into_owned()),
        None => Err(Error::Corrupt(format!(
            "link entry {} has no target",
            String::from_utf8_lossy(&entry.path_bytes())
        ))),
    }
}

fn apply_whiteout<T: Target + ?Sized>(target: &T, whiteout: Whiteout) -> Result<()> {
    let result = match &whiteout {
        Whiteout::Remove(path) => {
            trace!("removing {}", path.display());
            target.remove(path)
        }
        Whiteout::Opaque(path) => {
            trace!("clearing {}", path.display());
            target.clear_dir(path)
        }
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Creates missing ancestors of `path` for archives that omit directory entries.
fn ensure_parent<T: Target + ?Sized>(target: &T, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut current = PathBuf::new();
    for component in parent.components() {
        current.push(component);
        match target.mkdir(&current, 0o755) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
            _ => {}
        }
    }
    Ok(())
}

fn chown<T: Target + ?Sized>(target: &T, path: &Path, header: &Header) -> Result<()> {
    let id = |value: u64| {
        u32::try_from(value).map_err(|_| {
            Error::Corrupt(format!("{}: owner id {value} out of range", path.display()))
        })
    };
    let (uid, gid) = (id(header.uid()?)?, id(header.gid()?)?);
    match target.chown(path, uid, gid) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            debug!("not permitted to chown {} to {uid}:{gid}", path.display());
            Ok(())
        }
        result => Ok(result?),
    }
}

fn set_times<T: Target + ?Sized>(
    target: &T,
    path: &Path,
    header: &Header,
    now: SystemTime,
) -> Result<()> {
    let (atime, mtime) = header_times(header)?;
    // an unrepresentable mtime is out of range too
    let (atime, mtime) = clamp_times(atime, mtime.unwrap_or(now), now);
    Ok(target.chtimes(path, atime, mtime)?)
}

/// Creates (or reuses) a directory, writable by its owner until [`finish_dir`] runs.
fn unpack_dir<T: Target + ?Sized>(target: &T, path: &Path, header: &Header) -> Result<()> {
    ensure_parent(target, path)?;
    let mode = (header.mode()? & 0o7777) | 0o700;
    match target.mkdir(path, mode) {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
        _ => {}
    }
    Ok(target.chmod(path, mode)?)
}

fn finish_dir<T: Target + ?Sized>(
    target: &T,
    path: &Path,
    header: &Header,
    now: SystemTime,
) -> Result<()> {
    target.chmod(path, header.mode()? & 0o7777)?;
    chown(target, path, header)?;
    set_times(target, path, header, now)
}

fn unpack_file<T: Target + ?Sized, R: Read>(
    target: &T,
    path: &Path,
    entry: &mut Entry<'_, R>,
    now: SystemTime,
) -> Result<()> {
    ensure_parent(target, path)?;
    let mut file = target.create(path)?;
    if let Err(e) = io::copy(entry, &mut file) {
        if e.kind() == ErrorKind::UnexpectedEof {
            warn!(
                "{}: archive ended inside the entry ({} bytes expected)",
                path.display(),
                entry.header().size().unwrap_or(0)
            );
        }
        return Err(e.into());
    }
    drop(file);

    let header = entry.header();
    target.chmod(path, header.mode()? & 0o7777)?;
    chown(target, path, header)?;
    set_times(target, path, header, now)
}
