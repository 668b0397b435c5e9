//! OCI image layouts: `oci-layout`, `index.json` and `blobs/` under one directory.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::debug;
use oci_spec::image::{
    Descriptor, ImageIndex, ImageIndexBuilder, MediaType, OciLayout, OciLayoutBuilder,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    blob::{publish, BlobStore, STAGING_PREFIX},
    config::ImageOptions,
    image::{Image, REF_NAME_ANNOTATION},
    Error, Result, BLOBS_DIRECTORY, IMAGE_INDEX_FILE, IMAGE_LAYOUT_FILE,
};

pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    match File::open(path) {
        Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Replaces `path` with the JSON encoding of `value` in one rename.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut file = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    serde_json::to_writer(&mut file, value)?;
    file.write_all(b"\n")?;
    publish(file, path)?;
    Ok(())
}

/// An OCI image layout directory.
#[derive(Debug)]
pub struct ImageLayout {
    root: PathBuf,
    store: BlobStore,
    manifests: Vec<Descriptor>,
    annotations: HashMap<String, String>,
}

impl ImageLayout {
    /// Creates a new, empty layout at `root`.  Fails with [`Error::AlreadyExists`] if the
    /// directory or any of the layout files already exist.
    pub fn create(root: &Path) -> Result<Self> {
        for path in [
            root.to_path_buf(),
            root.join(IMAGE_LAYOUT_FILE),
            root.join(IMAGE_INDEX_FILE),
            root.join(BLOBS_DIRECTORY),
        ] {
            if path.symlink_metadata().is_ok() {
                return Err(Error::AlreadyExists(format!(
                    "image layout {}",
                    path.display()
                )));
            }
        }

        match fs::create_dir(root) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!("image layout {}", root.display())))
            }
            result => result?,
        }

        let layout = OciLayoutBuilder::default()
            .image_layout_version(IMAGE_LAYOUT_VERSION.to_string())
            .build()?;
        write_json(&root.join(IMAGE_LAYOUT_FILE), &layout)?;

        let result = Self {
            root: root.to_path_buf(),
            store: BlobStore::new(root),
            manifests: vec![],
            annotations: HashMap::new(),
        };
        result.write_index()?;
        fs::create_dir(root.join(BLOBS_DIRECTORY))?;
        debug!("created image layout {}", root.display());
        Ok(result)
    }

    /// Opens an existing layout, checking that all of its parts are present and well formed.
    pub fn open(root: &Path) -> Result<Self> {
        let index: ImageIndex = read_json(&root.join(IMAGE_INDEX_FILE))?;
        let layout: OciLayout = read_json(&root.join(IMAGE_LAYOUT_FILE))?;
        if !root.join(BLOBS_DIRECTORY).is_dir() {
            return Err(Error::NotFound(format!(
                "blobs directory of image layout {}",
                root.display()
            )));
        }
        debug!(
            "opened image layout {} (version {})",
            root.display(),
            layout.image_layout_version()
        );

        Ok(Self {
            root: root.to_path_buf(),
            store: BlobStore::new(root),
            manifests: index.manifests().clone(),
            annotations: index.annotations().clone().unwrap_or_default(),
        })
    }

    /// Whether `root` holds a layout that [`ImageLayout::open`] accepts.
    pub fn is_consistent(root: &Path) -> bool {
        Self::open(root).is_ok()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn add_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Starts a new image that will be stored in this layout.
    pub fn create_image(&self, reference: &str, options: ImageOptions) -> Result<Image> {
        Image::new(self.store.clone(), reference, options)
    }

    /// Reopens the most recently saved image named `reference`.
    pub fn open_image(&self, reference: &str, options: ImageOptions) -> Result<Image> {
        let descriptor = self
            .manifests
            .iter()
            .rev()
            .find(|descriptor| {
                descriptor
                    .annotations()
                    .as_ref()
                    .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                    .is_some_and(|name| name == reference)
            })
            .ok_or_else(|| Error::NotFound(format!("image {reference}")))?;
        Image::load(self.store.clone(), descriptor, options)
    }

    /// Closes `image` and adds its manifest to the index.  The index is written by
    /// [`ImageLayout::close`].
    pub fn save_image(&mut self, image: Image) -> Result<Descriptor> {
        let descriptor = image.close()?;
        self.manifests.push(descriptor.clone());
        Ok(descriptor)
    }

    fn write_index(&self) -> Result<()> {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(self.manifests.clone())
            .annotations(self.annotations.clone())
            .build()?;
        write_json(&self.root.join(IMAGE_INDEX_FILE), &index)
    }

    /// Writes `index.json`.
    pub fn close(self) -> Result<()> {
        self.write_index()?;
        debug!(
            "wrote index of {} with {} manifests",
            self.root.display(),
            self.manifests.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_create_open() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("layout");
        let layout = ImageLayout::create(&root)?;
        assert!(layout.manifests().is_empty());
        layout.close()?;

        assert!(root.join("oci-layout").is_file());
        assert!(root.join("index.json").is_file());
        assert!(root.join("blobs").is_dir());
        assert!(ImageLayout::is_consistent(&root));

        for file in ["oci-layout", "index.json"] {
            let mode = fs::metadata(root.join(file))?.permissions().mode();
            assert_eq!(mode & 0o7777, crate::blob::PUBLISHED_MODE, "{file}");
        }
        Ok(())
    }

    #[test]
    fn test_create_twice_fails() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("layout");
        let _layout = ImageLayout::create(&root)?;
        let err = ImageLayout::create(&root).unwrap_err();
        assert!(err.is_already_exists(), "{err}");
        Ok(())
    }

    #[test]
    fn test_open_incomplete() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("layout");
        ImageLayout::create(&root)?;
        fs::remove_dir(root.join("blobs"))?;
        assert!(!ImageLayout::is_consistent(&root));

        let err = ImageLayout::open(&td.path().join("missing")).unwrap_err();
        assert!(err.is_not_found(), "{err}");

        fs::write(root.join("index.json"), "{")?;
        assert!(ImageLayout::open(&root).is_err());
        Ok(())
    }

    #[test]
    fn test_index_annotations_persist() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("layout");
        let mut layout = ImageLayout::create(&root)?;
        layout.add_annotation("com.example.build", "42");
        layout.close()?;

        let reopened = ImageLayout::open(&root)?;
        assert_eq!(
            reopened.annotations().get("com.example.build").map(String::as_str),
            Some("42")
        );
        Ok(())
    }

    #[test]
    fn test_open_unknown_image() -> Result<()> {
        let td = tempfile::tempdir()?;
        let layout = ImageLayout::create(&td.path().join("layout"))?;
        let err = layout
            .open_image("nope", ImageOptions::default())
            .unwrap_err();
        assert!(err.is_not_found(), "{err}");
        Ok(())
    }
}
