//! Content-addressed blob storage.
//!
//! Blobs live at `<root>/blobs/<algorithm>/<hex>`.  A [`BlobWriter`] streams bytes into a staging
//! file (`<root>/.tmp.*`) while hashing them, and on [`BlobWriter::close`] renames the staging
//! file to its content-addressed path.  The rename is atomic because the staging file lives on
//! the same filesystem as the blob directory.  A crash before `close()` leaves the staging file
//! behind, outside of the addressed namespace.

use std::{
    fs::{create_dir_all, File, Permissions},
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType, Platform};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::{blob_relative_path, Algorithm, Hasher},
    Error, Result, BLOBS_DIRECTORY,
};

/// Prefix of staging files created in the layout root.
pub const STAGING_PREFIX: &str = ".tmp.";

/// Mode of published blobs and layout files.  Staging files start out owner-only.
pub const PUBLISHED_MODE: u32 = 0o644;

/// Makes a staging file world-readable and renames it to `path`.
pub(crate) fn publish(staging: NamedTempFile, path: &Path) -> io::Result<()> {
    staging
        .as_file()
        .set_permissions(Permissions::from_mode(PUBLISHED_MODE))?;
    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Handle to the blob namespace of one image layout.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIRECTORY)
    }

    /// The on-disk location of the blob with the given digest.
    pub fn path_for(&self, digest: &Digest) -> Result<PathBuf> {
        Ok(self.root.join(blob_relative_path(digest)?))
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.path_for(digest).is_ok_and(|path| path.is_file())
    }

    /// Starts a new blob.  The digest and size of the descriptor are computed from the data
    /// written and only known after [`BlobWriter::close`].
    pub fn writer(
        &self,
        media_type: MediaType,
        algorithm: Algorithm,
        platform: Option<Platform>,
    ) -> Result<BlobWriter> {
        BlobWriter::create(&self.root, media_type, algorithm, platform)
    }

    /// Stores an in-memory buffer as a blob.
    pub fn write_bytes(
        &self,
        media_type: MediaType,
        algorithm: Algorithm,
        data: &[u8],
    ) -> Result<Descriptor> {
        let mut writer = self.writer(media_type, algorithm, None)?;
        writer.write_all(data)?;
        writer.close()
    }

    /// Opens an existing blob by digest.
    pub fn open(&self, digest: &Digest) -> Result<BlobReader> {
        let path = self.path_for(digest)?;
        match File::open(&path) {
            Ok(file) => Ok(BlobReader {
                digest: digest.clone(),
                inner: BufReader::new(file),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the blob a descriptor refers to.
    pub fn open_descriptor(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        self.open(descriptor.digest())
    }
}

/// Streams bytes into a staging file while computing their digest.
#[derive(Debug)]
pub struct BlobWriter {
    blobs_root: PathBuf,
    staging: BufWriter<NamedTempFile>,
    hasher: Hasher,
    size: u64,
    media_type: MediaType,
    platform: Option<Platform>,
}

impl BlobWriter {
    /// Allocates a staging file in `dir`.  The finished blob will be published beneath
    /// `dir/blobs/`.
    pub fn create(
        dir: &Path,
        media_type: MediaType,
        algorithm: Algorithm,
        platform: Option<Platform>,
    ) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(dir)?;
        trace!("staging blob {media_type} at {}", staging.path().display());

        Ok(Self {
            blobs_root: dir.to_path_buf(),
            staging: BufWriter::new(staging),
            hasher: algorithm.hasher(),
            size: 0,
            media_type,
            platform,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.hasher.algorithm()
    }

    /// Number of bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Writes `value` as JSON.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut *self, value)?;
        Ok(())
    }

    /// Finalizes the digest, publishes the blob under its content address and returns the
    /// completed descriptor.
    pub fn close(self) -> Result<Descriptor> {
        let staging = self.staging.into_inner().map_err(|e| e.into_error())?;
        let digest = self.hasher.finalize()?;

        let target = self.blobs_root.join(blob_relative_path(&digest)?);
        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }
        publish(staging, &target)?;
        debug!(
            "stored blob {digest} ({} bytes) at {}",
            self.size,
            target.display()
        );

        let mut descriptor = DescriptorBuilder::default()
            .media_type(self.media_type)
            .digest(digest)
            .size(self.size)
            .build()?;
        descriptor.set_platform(self.platform);
        Ok(descriptor)
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.staging.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

/// Reads an existing blob.
#[derive(Debug)]
pub struct BlobReader {
    digest: Digest,
    inner: BufReader<File>,
}

impl BlobReader {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Deserializes the blob as JSON.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_reader(self.inner)?)
    }

    pub fn into_inner(self) -> BufReader<File> {
        self.inner
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::digest::digest_bytes;

    fn staging_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(STAGING_PREFIX))
            .collect()
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let payload = b"some bytes worth keeping".repeat(1000);

        let mut writer = store.writer(MediaType::ImageLayer, Algorithm::Sha256, None)?;
        writer.write_all(&payload[..10])?;
        writer.write_all(&payload[10..])?;
        assert_eq!(writer.size(), payload.len() as u64);
        let descriptor = writer.close()?;

        assert_eq!(descriptor.size(), payload.len() as u64);
        assert_eq!(
            descriptor.digest(),
            &digest_bytes(Algorithm::Sha256, &payload)?
        );
        assert!(store.contains(descriptor.digest()));

        let mut data = vec![];
        store.open_descriptor(&descriptor)?.read_to_end(&mut data)?;
        assert_eq!(data, payload);

        // the staging file is gone once published
        assert_eq!(staging_files(td.path()), Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn test_deterministic_path() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());

        let first = store.write_bytes(MediaType::ImageConfig, Algorithm::Sha512, b"same")?;
        let second = store.write_bytes(MediaType::ImageConfig, Algorithm::Sha512, b"same")?;
        assert_eq!(first.digest(), second.digest());
        assert_eq!(
            store.path_for(first.digest())?,
            store.path_for(second.digest())?
        );
        assert!(store
            .path_for(first.digest())?
            .starts_with(td.path().join("blobs/sha512")));
        Ok(())
    }

    #[test]
    fn test_media_type_and_platform_carried() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let platform = crate::config::host_platform()?;

        let writer = store.writer(
            MediaType::ImageConfig,
            Algorithm::Sha256,
            Some(platform.clone()),
        )?;
        let descriptor = writer.close()?;
        assert_eq!(descriptor.media_type(), &MediaType::ImageConfig);
        assert_eq!(descriptor.platform(), &Some(platform));
        assert_eq!(descriptor.size(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_blob() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let digest = digest_bytes(Algorithm::Sha256, b"never written")?;

        let err = store.open(&digest).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let value = BTreeMap::from([("k".to_string(), vec![1, 2, 3])]);

        let media_type = MediaType::Other("application/json".into());
        let mut writer = store.writer(media_type, Algorithm::Sha256, None)?;
        writer.encode(&value)?;
        let descriptor = writer.close()?;

        let decoded: BTreeMap<String, Vec<i32>> = store.open_descriptor(&descriptor)?.decode()?;
        assert_eq!(decoded, value);
        Ok(())
    }

    #[test]
    fn test_published_blob_world_readable() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let descriptor = store.write_bytes(MediaType::ImageLayer, Algorithm::Sha256, b"shared")?;

        let mode = std::fs::metadata(store.path_for(descriptor.digest())?)?
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, PUBLISHED_MODE);
        Ok(())
    }

    #[test]
    fn test_dropped_writer_leaves_nothing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());

        let mut writer = store.writer(MediaType::ImageLayer, Algorithm::Sha256, None)?;
        writer.write_all(b"abandoned")?;
        drop(writer);

        assert_eq!(staging_files(td.path()), Vec::<String>::new());
        assert!(!store.blobs_dir().exists());
        Ok(())
    }
}
