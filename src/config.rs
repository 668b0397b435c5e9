//! Explicit configuration for building images.
//!
//! Nothing in the library reads the environment on its own: the digest algorithm, layer
//! compression, target platform and path exclusions are carried by [`ImageOptions`] and handed
//! to the image, layer and archive writers.  [`ImageOptions::default()`] picks sha256, gzip,
//! the running host's platform and [`DEFAULT_EXCLUSIONS`].
//!
//! The host platform is resolved when an image is created, not when the options are built, so
//! options stay cheap to construct and the same value can describe images for other
//! platforms.

use oci_spec::image::{Arch, Os, Platform, PlatformBuilder};
use regex_automata::meta::Regex;

use crate::{archive::Compression, digest::Algorithm, Error, Result};

/// Archive paths that are never written into a layer.  These are non-portable
/// pseudo-devices.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["^dev/zconsole$"];

/// Options carried through image and layer construction.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub algorithm: Algorithm,
    pub compression: Compression,
    /// Platform recorded in the image config and descriptors; `None` means the running host.
    pub platform: Option<Platform>,
    pub exclusions: Exclusions,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::CANONICAL,
            compression: Compression::Gzip,
            platform: None,
            exclusions: Exclusions::default(),
        }
    }
}

impl ImageOptions {
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// The configured platform, or the running host's.
    pub fn resolved_platform(&self) -> Result<Platform> {
        match &self.platform {
            Some(platform) => Ok(platform.clone()),
            None => host_platform(),
        }
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }
}

/// The platform of the running host.
pub fn host_platform() -> Result<Platform> {
    Ok(PlatformBuilder::default()
        .architecture(Arch::default())
        .os(Os::default())
        .build()?)
}

/// A set of regular expressions matched against archive-relative paths (no leading `/`).
#[derive(Debug, Clone)]
pub struct Exclusions {
    patterns: Vec<String>,
    regex: Option<Regex>,
}

impl Exclusions {
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Result<Self> {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        let regex = if patterns.is_empty() {
            None
        } else {
            Some(
                Regex::new_many(&patterns)
                    .map_err(|e| Error::Corrupt(format!("invalid exclusion pattern: {e}")))?,
            )
        };
        Ok(Self { patterns, regex })
    }

    /// An exclusion set that matches nothing.
    pub fn none() -> Self {
        Self {
            patterns: vec![],
            regex: None,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, image_path: &str) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(image_path))
    }
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSIONS).unwrap_or_else(|_| Self::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exclusions() {
        let exclusions = Exclusions::new(DEFAULT_EXCLUSIONS).unwrap();
        assert!(exclusions.is_excluded("dev/zconsole"));
        assert!(!exclusions.is_excluded("dev/zconsole2"));
        assert!(!exclusions.is_excluded("usr/dev/zconsole"));
        assert!(!exclusions.is_excluded("dev/null"));
        assert_eq!(Exclusions::default().patterns(), ["^dev/zconsole$"]);
    }

    #[test]
    fn test_custom_exclusions() {
        let exclusions = Exclusions::new(["^proc/", r"\.pyc$"]).unwrap();
        assert!(exclusions.is_excluded("proc/self"));
        assert!(exclusions.is_excluded("usr/lib/x.pyc"));
        assert!(!exclusions.is_excluded("usr/lib/x.py"));
        assert!(!Exclusions::none().is_excluded("anything"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(Exclusions::new(["("]), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_options_builder() {
        let options = ImageOptions::default()
            .with_algorithm(Algorithm::Sha512)
            .with_compression(Compression::None)
            .with_exclusions(Exclusions::none());
        assert_eq!(options.algorithm, Algorithm::Sha512);
        assert_eq!(options.compression, Compression::None);
        assert!(options.exclusions.patterns().is_empty());
    }
}
