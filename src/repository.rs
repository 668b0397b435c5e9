//! A directory holding named image layouts.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use log::debug;

use crate::{layout::ImageLayout, Error, Result, IMAGE_LAYOUT_FILE};

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Creates an empty repository.  Fails with [`Error::AlreadyExists`] if `path` is already
    /// a directory.
    pub fn create(path: &Path) -> Result<Self> {
        if Self::is_repository(path) {
            return Err(Error::AlreadyExists(format!("repository {}", path.display())));
        }
        fs::create_dir_all(path)?;
        debug!("created repository {}", path.display());
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !Self::is_repository(path) {
            return Err(Error::NotFound(format!("repository {}", path.display())));
        }
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    pub fn is_repository(path: &Path) -> bool {
        path.is_dir()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout names are single path components.
    fn layout_path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(Error::Corrupt(format!("invalid image layout name {name:?}"))),
        }
    }

    pub fn create_image_layout(&self, name: &str) -> Result<ImageLayout> {
        ImageLayout::create(&self.layout_path(name)?)
    }

    pub fn open_image_layout(&self, name: &str) -> Result<ImageLayout> {
        ImageLayout::open(&self.layout_path(name)?)
    }

    pub fn has_image_layout(&self, name: &str) -> bool {
        self.layout_path(name)
            .is_ok_and(|path| path.join(IMAGE_LAYOUT_FILE).exists())
    }

    pub fn is_image_layout_consistent(&self, name: &str) -> bool {
        self.layout_path(name)
            .is_ok_and(|path| ImageLayout::is_consistent(&path))
    }

    /// Names of the layouts in this repository, sorted.
    pub fn image_layouts(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(IMAGE_LAYOUT_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_create_open() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("repo");

        assert!(Repository::open(&path).unwrap_err().is_not_found());
        let repo = Repository::create(&path)?;
        assert!(Repository::is_repository(&path));
        assert!(Repository::create(&path).unwrap_err().is_already_exists());
        assert_eq!(Repository::open(&path)?.root(), repo.root());
        Ok(())
    }

    #[test]
    fn test_layouts() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::create(&td.path().join("repo"))?;

        assert!(!repo.has_image_layout("base"));
        repo.create_image_layout("base")?.close()?;
        repo.create_image_layout("app")?.close()?;
        assert!(repo.has_image_layout("base"));
        assert!(repo.is_image_layout_consistent("base"));
        assert!(!repo.is_image_layout_consistent("missing"));
        assert!(repo.create_image_layout("base").unwrap_err().is_already_exists());
        assert_eq!(repo.image_layouts()?, ["app", "base"]);

        assert!(repo.create_image_layout("../escape").is_err());
        assert!(repo.open_image_layout("").is_err());
        Ok(())
    }
}
