//! Layer computation from two directory trees.
//!
//! The comparison is metadata only: permission bits, owner, group and size (in that order).
//! Two regular files with identical metadata but different content are considered unchanged.

use std::{
    fs::{self, Metadata},
    io::{self, ErrorKind},
    os::unix::fs::MetadataExt,
    path::Path,
};

use log::{debug, trace};
use oci_spec::image::Descriptor;
use walkdir::WalkDir;

use crate::{
    archive::EntryKind, blob::BlobStore, config::ImageOptions, layer::LayerWriter, Result,
};

/// What a diff wrote into its layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffStats {
    pub whiteouts: usize,
    pub replaced: usize,
    pub added: usize,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.whiteouts == 0 && self.replaced == 0 && self.added == 0
    }
}

fn is_not_dir(e: &io::Error) -> bool {
    e.raw_os_error() == Some(rustix::io::Errno::NOTDIR.raw_os_error())
}

/// `lstat` that reports a missing path (or one below a non-directory) as `None`.
fn lstat(path: &Path) -> Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == ErrorKind::NotFound || is_not_dir(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn metadata_differs(a: &Metadata, b: &Metadata) -> bool {
    if a.mode() & 0o7777 != b.mode() & 0o7777 {
        return true;
    }
    if a.uid() != b.uid() {
        return true;
    }
    if a.gid() != b.gid() {
        return true;
    }
    !a.is_dir() && a.len() != b.len()
}

/// Writes the changes turning `root_a` into `root_b` into `layer`.
///
/// Paths missing from `root_b` become whiteouts (a deleted directory yields a single whiteout),
/// changed paths are written as full copies from `root_b`, and paths new in `root_b` are
/// added.  A path whose type changed is whited out and then written anew.
pub fn diff_into(layer: &mut LayerWriter, root_a: &Path, root_b: &Path) -> Result<DiffStats> {
    let mut stats = DiffStats::default();

    let mut walk = WalkDir::new(root_a)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walk.next() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(root_a) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let a_meta = entry.metadata().map_err(io::Error::from)?;
        let a_kind = EntryKind::from(a_meta.file_type());
        let b_path = root_b.join(relative);

        let Some(b_meta) = lstat(&b_path)? else {
            debug!("deleted: {}", relative.display());
            layer.add_entry(entry.path(), relative, &a_meta, true)?;
            stats.whiteouts += 1;
            if a_kind == EntryKind::Directory {
                walk.skip_current_dir();
            }
            continue;
        };
        if a_kind == EntryKind::Special {
            continue;
        }

        let b_kind = EntryKind::from(b_meta.file_type());
        if a_kind != b_kind {
            debug!("type changed: {}", relative.display());
            layer.add_entry(entry.path(), relative, &a_meta, true)?;
            layer.add_entry(&b_path, relative, &b_meta, false)?;
            stats.whiteouts += 1;
            stats.replaced += 1;
            if a_kind == EntryKind::Directory {
                walk.skip_current_dir();
            }
            continue;
        }

        let changed = if a_kind == EntryKind::Symlink {
            fs::read_link(entry.path())? != fs::read_link(&b_path)?
        } else {
            metadata_differs(&a_meta, &b_meta)
        };
        if changed {
            debug!("changed: {}", relative.display());
            layer.add_entry(&b_path, relative, &b_meta, false)?;
            stats.replaced += 1;
        } else {
            trace!("unchanged: {}", relative.display());
        }
    }

    for entry in WalkDir::new(root_b).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(root_b) else {
            continue;
        };
        if relative.as_os_str().is_empty() || lstat(&root_a.join(relative))?.is_some() {
            continue;
        }
        let b_meta = entry.metadata().map_err(io::Error::from)?;
        if EntryKind::from(b_meta.file_type()) == EntryKind::Special {
            continue;
        }
        debug!("added: {}", relative.display());
        layer.add_entry(entry.path(), relative, &b_meta, false)?;
        stats.added += 1;
    }

    Ok(stats)
}

/// Computes the layer turning `root_a` into `root_b` and stores it in `store`.
pub fn diff(
    store: &BlobStore,
    options: &ImageOptions,
    root_a: &Path,
    root_b: &Path,
) -> Result<(Descriptor, DiffStats)> {
    let mut layer = LayerWriter::with_options(store, options)?;
    let stats = diff_into(&mut layer, root_a, root_b)?;
    let descriptor = layer.close()?;
    debug!(
        "diff {} -> {}: {stats:?} in {}",
        root_a.display(),
        root_b.display(),
        descriptor.digest()
    );
    Ok((descriptor, stats))
}
