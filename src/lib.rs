pub mod archive;
pub mod blob;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod image;
pub mod layer;
pub mod layout;
pub mod repository;

pub use error::{Error, Result};

/// Directory of an image layout that holds the content-addressed blobs.
pub const BLOBS_DIRECTORY: &str = "blobs";
/// The image index at the top of a layout.
pub const IMAGE_INDEX_FILE: &str = "index.json";
/// The layout marker file, recording the layout version.
pub const IMAGE_LAYOUT_FILE: &str = "oci-layout";
