//! Filesystem layers stored as blobs.
//!
//! A [`LayerWriter`] stacks an [`ArchiveWriter`] on top of a [`BlobWriter`], so the tar stream
//! is compressed, hashed and staged in one pass.  A [`LayerReader`] does the reverse, picking
//! the decompressor from the descriptor's media type.

use std::{fs::Metadata, io::Read, path::Path};

use log::debug;
use oci_spec::image::{Descriptor, Digest};
use tar::Entries;

use crate::{
    archive::{reader::ArchiveReader, target::Target, writer::ArchiveWriter, Compression},
    blob::{BlobStore, BlobWriter},
    config::{Exclusions, ImageOptions},
    digest::Algorithm,
    Result,
};

pub struct LayerWriter {
    archive: ArchiveWriter<BlobWriter>,
}

impl LayerWriter {
    pub fn new(
        store: &BlobStore,
        algorithm: Algorithm,
        compression: Compression,
        exclusions: Exclusions,
    ) -> Result<Self> {
        let blob = store.writer(compression.layer_media_type(), algorithm, None)?;
        debug!("new {compression:?} layer in {}", store.root().display());
        Ok(Self {
            archive: ArchiveWriter::new(blob, compression, exclusions)?,
        })
    }

    pub fn with_options(store: &BlobStore, options: &ImageOptions) -> Result<Self> {
        Self::new(
            store,
            options.algorithm,
            options.compression,
            options.exclusions.clone(),
        )
    }

    pub fn add_entry(
        &mut self,
        source: &Path,
        image_path: &Path,
        metadata: &Metadata,
        whiteout: bool,
    ) -> Result<()> {
        self.archive.add_entry(source, image_path, metadata, whiteout)
    }

    pub fn add_tree(&mut self, root: &Path, base: &Path) -> Result<()> {
        self.archive.add_tree(root, base)
    }

    pub fn whiteout_file(&mut self, image_path: &Path) -> Result<()> {
        self.archive.whiteout_file(image_path)
    }

    /// Finishes the archive and publishes the layer blob.
    pub fn close(self) -> Result<Descriptor> {
        let descriptor = self.archive.close()?.close()?;
        debug!("closed layer {} ({} bytes)", descriptor.digest(), descriptor.size());
        Ok(descriptor)
    }
}

pub struct LayerReader {
    digest: Digest,
    archive: ArchiveReader<'static>,
}

impl LayerReader {
    pub fn open(store: &BlobStore, descriptor: &Descriptor) -> Result<Self> {
        let compression = Compression::from_media_type(descriptor.media_type());
        let blob = store.open_descriptor(descriptor)?;
        debug!("opened layer {} as {compression:?}", descriptor.digest());
        Ok(Self {
            digest: descriptor.digest().clone(),
            archive: ArchiveReader::new(blob, compression)?,
        })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn extract_tree_into<T: Target + ?Sized>(&mut self, target: &T) -> Result<()> {
        self.archive.extract_tree_into(target)
    }

    pub fn entries(&mut self) -> Result<Entries<'_, Box<dyn Read>>> {
        self.archive.entries()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use oci_spec::image::MediaType;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::archive::target::DirTarget;

    #[test]
    fn test_layer_round_trip() -> Result<()> {
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let td = tempfile::tempdir()?;
            let store = BlobStore::new(td.path());
            let source = td.path().join("source");
            fs::create_dir_all(source.join("etc"))?;
            fs::write(source.join("etc/motd"), "welcome\n")?;

            let mut writer =
                LayerWriter::new(&store, Algorithm::Sha256, compression, Exclusions::none())?;
            writer.add_tree(&source, Path::new(""))?;
            let descriptor = writer.close()?;
            assert_eq!(descriptor.media_type(), &compression.layer_media_type());
            assert!(store.contains(descriptor.digest()));

            let extracted = td.path().join("extracted");
            fs::create_dir(&extracted)?;
            let mut reader = LayerReader::open(&store, &descriptor)?;
            assert_eq!(reader.digest(), descriptor.digest());
            reader.extract_tree_into(&DirTarget::new(&extracted))?;
            assert_eq!(fs::read_to_string(extracted.join("etc/motd"))?, "welcome\n");
        }
        Ok(())
    }

    #[test]
    fn test_gzip_media_type_by_default() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = BlobStore::new(td.path());
        let writer = LayerWriter::with_options(&store, &ImageOptions::default())?;
        let descriptor = writer.close()?;
        assert_eq!(descriptor.media_type(), &MediaType::ImageLayerGzip);

        // an empty layer is still a valid archive
        let mut reader = LayerReader::open(&store, &descriptor)?;
        assert_eq!(reader.entries()?.count(), 0);
        Ok(())
    }
}
