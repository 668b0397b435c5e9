//! Destinations for archive extraction.
//!
//! The extractor never touches the filesystem directly: everything goes through a [`Target`],
//! which resolves archive-relative paths itself.  Symlink support is optional and exposed via
//! [`Target::linker`]; a target without a linker silently drops symlink and hardlink entries.

use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    os::unix::fs::{lchown, PermissionsExt},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rustix::fs::{mkdirat, symlinkat, utimensat, AtFlags, Mode, Timespec, Timestamps, CWD};

/// A writable filesystem that archive entries can be materialized into.  Paths are relative
/// to the target's root and have already been checked not to escape it.
pub trait Target {
    type File: Write;

    /// Creates (or truncates) a regular file.
    fn create(&self, path: &Path) -> io::Result<Self::File>;

    /// Creates a directory.  Fails with `AlreadyExists` if something is at `path`.
    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Removes `path` and, for directories, everything beneath it.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Removes everything inside the directory at `path`, keeping the directory itself.
    fn clear_dir(&self, path: &Path) -> io::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;

    /// Symlink capability, if the target has one.
    fn linker(&self) -> Option<&dyn Linker> {
        None
    }
}

pub trait Linker {
    /// Creates a symlink at `path` pointing to `target`.  Fails with `AlreadyExists` if
    /// something is at `path`.
    fn symlink(&self, target: &Path, path: &Path) -> io::Result<()>;
}

/// A [`Target`] backed by a directory on the host.
#[derive(Debug, Clone)]
pub struct DirTarget {
    root: PathBuf,
    links: bool,
}

impl DirTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            links: true,
        }
    }

    /// Drops symlink support: links in the archive are skipped.
    pub fn without_links(mut self) -> Self {
        self.links = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

fn timespec(time: SystemTime) -> Timespec {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => Timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos().into(),
        },
        Err(e) => {
            let d = e.duration();
            let mut tv_sec = -(d.as_secs() as i64);
            let mut tv_nsec = 0;
            if d.subsec_nanos() > 0 {
                tv_sec -= 1;
                tv_nsec = 1_000_000_000 - d.subsec_nanos();
            }
            Timespec {
                tv_sec,
                tv_nsec: tv_nsec.into(),
            }
        }
    }
}

impl Target for DirTarget {
    type File = File;

    fn create(&self, path: &Path) -> io::Result<File> {
        let path = self.resolve(path);
        // never write through a symlink left by an earlier layer
        if path.symlink_metadata().is_ok_and(|m| m.is_symlink()) {
            fs::remove_file(&path)?;
        }
        File::create(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        Ok(mkdirat(CWD, self.resolve(path), Mode::from_raw_mode(mode))?)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let path = self.resolve(path);
        if path.symlink_metadata()?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn clear_dir(&self, path: &Path) -> io::Result<()> {
        let dir = self.resolve(path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        lchown(self.resolve(path), Some(uid), Some(gid))
    }

    fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let times = Timestamps {
            last_access: timespec(atime),
            last_modification: timespec(mtime),
        };
        Ok(utimensat(
            CWD,
            self.resolve(path),
            &times,
            AtFlags::SYMLINK_NOFOLLOW,
        )?)
    }

    fn linker(&self) -> Option<&dyn Linker> {
        if self.links {
            Some(self)
        } else {
            None
        }
    }
}

impl Linker for DirTarget {
    fn symlink(&self, target: &Path, path: &Path) -> io::Result<()> {
        Ok(symlinkat(target, CWD, self.resolve(path))?)
    }
}
