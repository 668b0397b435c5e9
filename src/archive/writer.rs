use std::{
    collections::HashMap,
    fs::{self, File, Metadata},
    io::{self, Read, Seek, SeekFrom, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, trace};
use tar::{EntryType, Header};
use walkdir::WalkDir;

use super::{
    strip_leading_separator, whiteout_name, CompressedWriter, Compression, DevIno, EntryKind,
    WHITEOUT_MODE, WHITEOUT_PAYLOAD,
};
use crate::{config::Exclusions, Result};

struct DeferredSymlink {
    header: Header,
    path: PathBuf,
    target: PathBuf,
}

/// Serializes filesystem entries into a (possibly compressed) GNU tar stream.
///
/// Regular files that share a device and inode with an earlier entry become hardlink entries.
/// Symlinks are buffered and appended in [`ArchiveWriter::close`], after every other entry, so
/// that extraction never has to create a link before its target's directory exists.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<CompressedWriter<W>>,
    exclusions: Exclusions,
    seen: HashMap<DevIno, PathBuf>,
    symlinks: Vec<DeferredSymlink>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn header_from_metadata(metadata: &Metadata, entry_type: EntryType) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(metadata.mode() & 0o7777);
    header.set_uid(metadata.uid().into());
    header.set_gid(metadata.gid().into());
    header.set_mtime(metadata.mtime().max(0) as u64);
    if let Some(gnu) = header.as_gnu_mut() {
        gnu.set_atime(metadata.atime().max(0) as u64);
        gnu.set_ctime(metadata.ctime().max(0) as u64);
    }
    header.set_size(0);
    header
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W, compression: Compression, exclusions: Exclusions) -> Result<Self> {
        Ok(Self {
            builder: tar::Builder::new(compression.encoder(sink)?),
            exclusions,
            seen: HashMap::new(),
            symlinks: vec![],
        })
    }

    /// Appends one filesystem object found at `source` under the name `image_path`.
    ///
    /// `metadata` must describe `source` without following symlinks.  With `whiteout` set, a
    /// whiteout entry deleting `image_path` is written instead of the object itself.
    pub fn add_entry(
        &mut self,
        source: &Path,
        image_path: &Path,
        metadata: &Metadata,
        whiteout: bool,
    ) -> Result<()> {
        let image_path = strip_leading_separator(image_path);
        if image_path.as_os_str().is_empty() {
            return Ok(());
        }
        if self.exclusions.is_excluded(&image_path.to_string_lossy()) {
            debug!("excluding {}", image_path.display());
            return Ok(());
        }
        if whiteout {
            return self.whiteout_file(image_path);
        }

        match EntryKind::from(metadata.file_type()) {
            EntryKind::Special => {
                trace!("skipping special file {}", source.display());
            }
            EntryKind::Directory => {
                let mut header = header_from_metadata(metadata, EntryType::Directory);
                self.builder
                    .append_data(&mut header, image_path, io::empty())?;
            }
            kind @ (EntryKind::BlockDevice | EntryKind::CharDevice) => {
                let entry_type = if kind == EntryKind::BlockDevice {
                    EntryType::Block
                } else {
                    EntryType::Char
                };
                let mut header = header_from_metadata(metadata, entry_type);
                let rdev = metadata.rdev();
                header.set_device_major(rustix::fs::major(rdev))?;
                header.set_device_minor(rustix::fs::minor(rdev))?;
                self.builder
                    .append_data(&mut header, image_path, io::empty())?;
            }
            EntryKind::Symlink => {
                let target = fs::read_link(source)?;
                let header = header_from_metadata(metadata, EntryType::Symlink);
                self.symlinks.push(DeferredSymlink {
                    header,
                    path: image_path.to_path_buf(),
                    target,
                });
            }
            EntryKind::Regular => self.add_file(source, image_path, metadata)?,
        }
        Ok(())
    }

    fn add_file(&mut self, source: &Path, image_path: &Path, metadata: &Metadata) -> Result<()> {
        let mut file = File::open(source)?;
        if let Err(e) = file.read(&mut [0u8; 1]) {
            debug!("skipping unreadable file {}: {e}", source.display());
            return Ok(());
        }
        file.seek(SeekFrom::Start(0))?;

        let devino = DevIno {
            dev: metadata.dev(),
            ino: metadata.ino(),
        };
        if let Some(original) = self.seen.get(&devino) {
            let mut header = header_from_metadata(metadata, EntryType::Link);
            self.builder.append_link(&mut header, image_path, original)?;
            return Ok(());
        }
        self.seen.insert(devino, image_path.to_path_buf());

        let mut header = header_from_metadata(metadata, EntryType::Regular);
        header.set_size(metadata.len());
        self.builder
            .append_data(&mut header, image_path, file.take(metadata.len()))?;
        Ok(())
    }

    /// Appends a whiteout entry deleting `image_path` in lower layers.
    pub fn whiteout_file(&mut self, image_path: &Path) -> Result<()> {
        let image_path = strip_leading_separator(image_path);
        let now = now_secs();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(WHITEOUT_MODE);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(now);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(now);
            gnu.set_ctime(now);
        }
        header.set_size(WHITEOUT_PAYLOAD.len() as u64);
        trace!("whiteout {}", image_path.display());
        self.builder
            .append_data(&mut header, whiteout_name(image_path), WHITEOUT_PAYLOAD)?;
        Ok(())
    }

    /// Walks `root` in lexical order and appends every entry below it, named relative to
    /// `base` (the root itself maps to `base`).
    pub fn add_tree(&mut self, root: &Path, base: &Path) -> Result<()> {
        debug!("packing {} as /{}", root.display(), base.display());
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path());
            let image_path = if relative.as_os_str().is_empty() {
                base.to_path_buf()
            } else {
                base.join(relative)
            };
            let metadata = entry.metadata().map_err(io::Error::from)?;
            self.add_entry(entry.path(), &image_path, &metadata, false)?;
        }
        Ok(())
    }

    /// Number of symlinks waiting to be written by [`ArchiveWriter::close`].
    pub fn pending_symlinks(&self) -> usize {
        self.symlinks.len()
    }

    /// Appends the deferred symlinks, writes the end-of-archive marker, flushes the
    /// compressor and returns the sink.
    pub fn close(self) -> Result<W> {
        let Self {
            mut builder,
            symlinks,
            ..
        } = self;
        for mut link in symlinks {
            builder.append_link(&mut link.header, &link.path, &link.target)?;
        }
        Ok(builder.into_inner()?.finish()?)
    }
}
