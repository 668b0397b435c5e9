//! Assembly of a single OCI image: layers, config and manifest.

use std::{
    collections::HashMap,
    fs::File,
    io,
    path::Path,
};

use log::debug;
use oci_spec::image::{
    Arch, Descriptor, History, HistoryBuilder, ImageConfigurationBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, Platform, PlatformBuilder, RootFsBuilder,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    archive::target::{DirTarget, Target},
    blob::BlobStore,
    config::ImageOptions,
    diff::{self, DiffStats},
    digest::parse_digest,
    layer::{LayerReader, LayerWriter},
    Error, Result,
};

/// Manifest annotation naming the image within its layout.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A history entry recording the command that produced a layer.
pub fn history(created_by: &str) -> Result<History> {
    Ok(HistoryBuilder::default()
        .created_by(created_by.to_string())
        .build()?)
}

// The parts of a stored image config needed to resume building on it.
#[derive(Deserialize)]
struct StoredConfig {
    architecture: Arch,
    os: Os,
    rootfs: StoredRootFs,
    #[serde(default)]
    history: Option<Vec<History>>,
}

#[derive(Deserialize)]
struct StoredRootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// An image under construction (or reopened from its manifest).
///
/// Layers are only ever appended, and each appended layer records its digest as the matching
/// diff ID, so `layers()[i].digest()` and `diff_ids()[i]` always agree.
#[derive(Debug)]
pub struct Image {
    store: BlobStore,
    options: ImageOptions,
    platform: Platform,
    reference: String,
    annotations: HashMap<String, String>,
    layers: Vec<Descriptor>,
    diff_ids: Vec<String>,
    history: Vec<History>,
    config: Option<Descriptor>,
}

impl Image {
    pub(crate) fn new(store: BlobStore, reference: &str, options: ImageOptions) -> Result<Self> {
        let platform = options.resolved_platform()?;
        Ok(Self {
            store,
            options,
            platform,
            reference: reference.to_string(),
            annotations: HashMap::from([(
                REF_NAME_ANNOTATION.to_string(),
                reference.to_string(),
            )]),
            layers: vec![],
            diff_ids: vec![],
            history: vec![],
            config: None,
        })
    }

    /// Reloads an image from the manifest `descriptor` points at.
    pub(crate) fn load(
        store: BlobStore,
        descriptor: &Descriptor,
        options: ImageOptions,
    ) -> Result<Self> {
        let manifest: ImageManifest = store.open_descriptor(descriptor)?.decode()?;
        let config: StoredConfig = store.open_descriptor(manifest.config())?.decode()?;

        let platform = match descriptor.platform() {
            Some(platform) => platform.clone(),
            None => PlatformBuilder::default()
                .architecture(config.architecture)
                .os(config.os)
                .build()?,
        };
        let annotations = manifest.annotations().clone().unwrap_or_default();
        let reference = annotations
            .get(REF_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            store,
            options,
            platform,
            reference,
            annotations,
            layers: manifest.layers().clone(),
            diff_ids: config.rootfs.diff_ids,
            history: config.history.unwrap_or_default(),
            config: Some(manifest.config().clone()),
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.layers
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.diff_ids
    }

    pub fn history(&self) -> &[History] {
        &self.history
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    /// The config descriptor written by the last [`Image::save_config`], if any.
    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        self.config.as_ref()
    }

    pub fn add_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Stores `data` as a JSON blob and records its digest in the manifest annotation
    /// `label`.
    pub fn add_metadata<T: Serialize + ?Sized>(
        &mut self,
        label: &str,
        media_type: MediaType,
        data: &T,
    ) -> Result<Descriptor> {
        if label.is_empty() {
            return Err(Error::Corrupt("metadata label must not be empty".into()));
        }
        let mut writer = self.store.writer(media_type, self.options.algorithm, None)?;
        writer.encode(data)?;
        let descriptor = writer.close()?;
        self.annotations
            .insert(label.to_string(), descriptor.digest().to_string());
        Ok(descriptor)
    }

    /// Decodes the blob recorded under annotation `label`.  The blob must already be present
    /// in the layout.
    pub fn get_metadata<T: DeserializeOwned>(&self, label: &str) -> Result<T> {
        let Some(digest) = self.annotations.get(label) else {
            return Err(Error::NotFound(format!("metadata {label:?}")));
        };
        self.store.open(&parse_digest(digest)?)?.decode()
    }

    /// Writes the image config blob.
    pub fn save_config(&mut self) -> Result<Descriptor> {
        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(self.diff_ids.clone())
            .build()?;
        let config = ImageConfigurationBuilder::default()
            .architecture(self.platform.architecture().clone())
            .os(self.platform.os().clone())
            .rootfs(rootfs)
            .history(self.history.clone())
            .build()?;

        let mut writer = self.store.writer(
            MediaType::ImageConfig,
            self.options.algorithm,
            Some(self.platform.clone()),
        )?;
        writer.encode(&config)?;
        let descriptor = writer.close()?;
        self.config = Some(descriptor.clone());
        Ok(descriptor)
    }

    fn push_layer(&mut self, descriptor: Descriptor, history: History) {
        debug!("{}: appending layer {}", self.reference, descriptor.digest());
        self.diff_ids.push(descriptor.digest().to_string());
        self.layers.push(descriptor);
        self.history.push(history);
    }

    /// Appends layers that are already stored in the layout.
    pub fn add_layer_descriptors(&mut self, descriptors: impl IntoIterator<Item = Descriptor>) {
        for descriptor in descriptors {
            self.diff_ids.push(descriptor.digest().to_string());
            self.layers.push(descriptor);
        }
    }

    /// Copies a prebuilt layer archive into the layout and appends it.
    pub fn add_layer_file(
        &mut self,
        path: &Path,
        media_type: MediaType,
        history: History,
    ) -> Result<Descriptor> {
        let mut source = File::open(path)?;
        let mut writer = self.store.writer(media_type, self.options.algorithm, None)?;
        io::copy(&mut source, &mut writer)?;
        let descriptor = writer.close()?;
        self.push_layer(descriptor.clone(), history);
        Ok(descriptor)
    }

    /// Archives the whole tree at `root` as a new layer.
    pub fn add_tree(&mut self, root: &Path, history: History) -> Result<Descriptor> {
        let mut layer = LayerWriter::with_options(&self.store, &self.options)?;
        layer.add_tree(root, Path::new(""))?;
        let descriptor = layer.close()?;
        self.push_layer(descriptor.clone(), history);
        Ok(descriptor)
    }

    /// Appends a layer holding the changes from `lower` to `upper`.
    pub fn add_diff(
        &mut self,
        lower: &Path,
        upper: &Path,
        history: History,
    ) -> Result<(Descriptor, DiffStats)> {
        let (descriptor, stats) = diff::diff(&self.store, &self.options, lower, upper)?;
        self.push_layer(descriptor.clone(), history);
        Ok((descriptor, stats))
    }

    /// Applies every layer, bottom first, to `target`.
    pub fn extract_into_target<T: Target + ?Sized>(&self, target: &T) -> Result<()> {
        for descriptor in &self.layers {
            LayerReader::open(&self.store, descriptor)?.extract_tree_into(target)?;
        }
        Ok(())
    }

    /// Applies every layer, bottom first, to the directory `root`.
    pub fn extract_into(&self, root: &Path) -> Result<()> {
        self.extract_into_target(&DirTarget::new(root))
    }

    /// Saves the config, writes the manifest and returns the manifest's descriptor.
    pub fn close(mut self) -> Result<Descriptor> {
        let config = self.save_config()?;
        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(self.layers.clone())
            .annotations(self.annotations.clone())
            .build()?;

        let mut writer = self.store.writer(
            MediaType::ImageManifest,
            self.options.algorithm,
            Some(self.platform.clone()),
        )?;
        writer.encode(&manifest)?;
        let mut descriptor = writer.close()?;
        if !self.annotations.is_empty() {
            descriptor.set_annotations(Some(self.annotations));
        }
        debug!("closed image {} as {}", self.reference, descriptor.digest());
        Ok(descriptor)
    }
}
