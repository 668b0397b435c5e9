//! Error types for ocistore.
//!
//! All library operations return [`Result<T>`], an alias for
//! `Result<T, Error>`. The variants mirror the failure kinds a caller can
//! act on:
//!
//! - [`NotFound`]: a blob, layout, repository or metadata label is missing
//! - [`AlreadyExists`]: a repository or image layout was created twice
//! - [`Corrupt`], [`Json`], [`Spec`]: malformed archives or metadata
//! - [`Unsupported`]: an object type reached a path with no handling
//! - [`Io`]: any other underlying read/write/rename failure
//!
//! [`NotFound`]: Error::NotFound
//! [`AlreadyExists`]: Error::AlreadyExists
//! [`Corrupt`]: Error::Corrupt
//! [`Json`]: Error::Json
//! [`Spec`]: Error::Spec
//! [`Unsupported`]: Error::Unsupported
//! [`Io`]: Error::Io

use std::io::ErrorKind;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for image store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The named object exists already and may only be created once.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Archive or metadata content is malformed.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The object type is valid but has no handling on this path.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An OCI structure could not be built or parsed.
    #[error("OCI spec error: {0}")]
    Spec(#[from] oci_spec::OciSpecError),
}

impl Error {
    /// True for [`Error::NotFound`] and for I/O errors of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for [`Error::AlreadyExists`] and for I/O errors of kind `AlreadyExists`.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::Io(e) => e.kind() == ErrorKind::AlreadyExists,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(Error::NotFound("blob".into()).is_not_found());
        assert!(Error::Io(ErrorKind::NotFound.into()).is_not_found());
        assert!(!Error::Io(ErrorKind::PermissionDenied.into()).is_not_found());
        assert!(Error::AlreadyExists("layout".into()).is_already_exists());
        assert!(!Error::Corrupt("x".into()).is_already_exists());
    }
}
