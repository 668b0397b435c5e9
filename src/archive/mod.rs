//! Tar codec for filesystem layers.
//!
//! Layers are GNU-format tar streams, optionally gzip or zstd compressed.  Deletions are
//! recorded as whiteout entries: a path `a/b` is deleted by an entry named `a/.wh.b`, and an
//! entry named `a/.wh..wh.opq` marks directory `a` as opaque (everything below it from lower
//! layers is hidden).
//!
//! [`writer::ArchiveWriter`] serializes filesystem entries, [`reader::ArchiveReader`]
//! materializes them into a [`target::Target`].

pub mod reader;
pub mod target;
pub mod writer;

use std::{
    ffi::{OsStr, OsString},
    fs::FileType,
    io::{self, Read, Write},
    os::unix::{ffi::OsStrExt, fs::FileTypeExt},
    path::{Component, Path, PathBuf},
};

use oci_spec::image::MediaType;

use crate::{Error, Result};

/// Prefix marking a whiteout entry's file name.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// File name of an opaque-directory marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh.opq";
/// Payload carried by whiteout entries.
pub const WHITEOUT_PAYLOAD: &[u8] = b"WHITEOUT";
/// Mode of whiteout entries.
pub const WHITEOUT_MODE: u32 = 0o222;

/// Compression applied around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// Chooses the decoder for a layer from its declared media type.
    pub fn from_media_type(media_type: &MediaType) -> Self {
        match media_type {
            MediaType::ImageLayerGzip => Compression::Gzip,
            MediaType::ImageLayerZstd => Compression::Zstd,
            MediaType::ImageLayer => Compression::None,
            other => {
                let name = other.to_string();
                if name.contains("gzip") || name.ends_with("gz") {
                    Compression::Gzip
                } else if name.contains("zstd") {
                    Compression::Zstd
                } else {
                    Compression::None
                }
            }
        }
    }

    /// The media type of a layer written with this compression.
    pub fn layer_media_type(self) -> MediaType {
        match self {
            Compression::None => MediaType::ImageLayer,
            Compression::Gzip => MediaType::ImageLayerGzip,
            Compression::Zstd => MediaType::ImageLayerZstd,
        }
    }

    pub(crate) fn encoder<W: Write>(self, sink: W) -> io::Result<CompressedWriter<W>> {
        Ok(match self {
            Compression::None => CompressedWriter::Plain(sink),
            Compression::Gzip => CompressedWriter::Gzip(flate2::write::GzEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
            Compression::Zstd => {
                CompressedWriter::Zstd(zstd::stream::write::Encoder::new(sink, 0)?)
            }
        })
    }

    pub(crate) fn decoder<'a, R: Read + 'a>(self, source: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(source),
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(source)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
        })
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::Unsupported(format!("compression {other}"))),
        }
    }
}

/// A byte sink with an optional compressor in front of it.
pub(crate) enum CompressedWriter<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Flushes the compressor's trailer and returns the sink.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            CompressedWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CompressedWriter::Gzip(gz) => gz.finish(),
            CompressedWriter::Zstd(zst) => zst.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Gzip(w) => w.write(buf),
            CompressedWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Gzip(w) => w.flush(),
            CompressedWriter::Zstd(w) => w.flush(),
        }
    }
}

/// The kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    /// Sockets and named pipes: not representable in a portable layer.
    Special,
}

impl From<FileType> for EntryKind {
    fn from(ft: FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_socket() || ft.is_fifo() {
            EntryKind::Special
        } else {
            EntryKind::Regular
        }
    }
}

/// Identity of a file on the host, used to spot hardlinks within one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevIno {
    pub dev: u64,
    pub ino: u64,
}

/// Strips a single leading `/` so the path is archive-relative.
pub fn strip_leading_separator(path: &Path) -> &Path {
    match path.as_os_str().as_bytes().strip_prefix(b"/") {
        Some(rest) => Path::new(OsStr::from_bytes(rest)),
        None => path,
    }
}

/// `dir/name` becomes `dir/.wh.name`.
pub fn whiteout_name(path: &Path) -> PathBuf {
    let mut name = OsString::from(WHITEOUT_PREFIX);
    name.push(path.file_name().unwrap_or(path.as_os_str()));
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// What a whiteout entry at `path` asks the extractor to do.
#[derive(Debug, PartialEq, Eq)]
pub enum Whiteout {
    /// Delete this path.
    Remove(PathBuf),
    /// Empty this directory.
    Opaque(PathBuf),
}

/// Decodes a whiteout entry name, or returns `None` for ordinary entries.
pub fn parse_whiteout(path: &Path) -> Option<Whiteout> {
    let name = path.file_name()?.as_bytes();
    let parent = path.parent().unwrap_or(Path::new(""));
    if name == WHITEOUT_OPAQUE.as_bytes() {
        return Some(Whiteout::Opaque(parent.to_path_buf()));
    }
    let deleted = name.strip_prefix(WHITEOUT_PREFIX.as_bytes())?;
    if deleted.is_empty() {
        return None;
    }
    Some(Whiteout::Remove(parent.join(OsStr::from_bytes(deleted))))
}

/// Normalizes an archive entry path into a relative path that can't escape the extraction
/// root.
pub fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::Corrupt(format!(
                    "archive entry {} escapes the extraction root",
                    path.display()
                )))
            }
        }
    }
    Ok(clean)
}

/// A relative symlink target that, placed at `link`, resolves to `target`.  Both paths are
/// relative to the same root.
pub fn relative_link_target(link: &Path, target: &Path) -> PathBuf {
    let depth = link
        .parent()
        .map_or(0, |parent| parent.components().count());
    let mut result = PathBuf::new();
    for _ in 0..depth {
        result.push("..");
    }
    result.push(target);
    result
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_whiteout_names() {
        assert_eq!(whiteout_name(Path::new("a")), PathBuf::from(".wh.a"));
        assert_eq!(whiteout_name(Path::new("a/b.txt")), PathBuf::from("a/.wh.b.txt"));

        assert_eq!(
            parse_whiteout(Path::new("a/.wh.b.txt")),
            Some(Whiteout::Remove(PathBuf::from("a/b.txt")))
        );
        assert_eq!(
            parse_whiteout(Path::new(".wh.a")),
            Some(Whiteout::Remove(PathBuf::from("a")))
        );
        assert_eq!(
            parse_whiteout(Path::new("x/.wh..wh.opq")),
            Some(Whiteout::Opaque(PathBuf::from("x")))
        );
        assert_eq!(parse_whiteout(Path::new("a/b.wh.c")), None);
        assert_eq!(parse_whiteout(Path::new("a/.wh.")), None);
    }

    #[test]
    fn test_strip_leading_separator() {
        assert_eq!(strip_leading_separator(Path::new("/etc/passwd")), Path::new("etc/passwd"));
        assert_eq!(strip_leading_separator(Path::new("etc")), Path::new("etc"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_entry_path(Path::new("./a/./b")).unwrap(), PathBuf::from("a/b"));
        assert!(sanitize_entry_path(Path::new("a/../../etc")).is_err());
        assert!(sanitize_entry_path(Path::new("/etc/shadow")).is_err());
    }

    #[test]
    fn test_relative_link_target() {
        assert_eq!(
            relative_link_target(Path::new("link"), Path::new("file")),
            PathBuf::from("file")
        );
        assert_eq!(
            relative_link_target(Path::new("a/b/link"), Path::new("a/file")),
            PathBuf::from("../../a/file")
        );
    }

    #[test]
    fn test_media_types() {
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            assert_eq!(
                Compression::from_media_type(&compression.layer_media_type()),
                compression
            );
        }
        assert_eq!(
            Compression::from_media_type(&MediaType::Other(
                "application/vnd.docker.image.rootfs.diff.tar.gzip".into()
            )),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_media_type(&MediaType::ImageConfig),
            Compression::None
        );
    }

    #[test]
    fn test_compression_round_trip() {
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let mut writer = compression.encoder(Vec::new()).unwrap();
            writer.write_all(b"compressed payload").unwrap();
            let bytes = writer.finish().unwrap();

            let mut out = vec![];
            compression
                .decoder(bytes.as_slice())
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            assert_eq!(out, b"compressed payload");
        }
    }
}
