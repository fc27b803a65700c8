//! Virtual filesystem error types

use thiserror::Error;

/// Errors returned by every vfs backend
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`VfsError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Transient,
    Fatal,
}

impl VfsError {
    pub fn kind(&self) -> VfsErrorKind {
        match self {
            VfsError::NotFound(_) => VfsErrorKind::NotFound,
            VfsError::AlreadyExists(_) => VfsErrorKind::AlreadyExists,
            VfsError::PermissionDenied(_) => VfsErrorKind::PermissionDenied,
            VfsError::Transient(_) => VfsErrorKind::Transient,
            VfsError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => VfsErrorKind::NotFound,
                std::io::ErrorKind::AlreadyExists => VfsErrorKind::AlreadyExists,
                std::io::ErrorKind::PermissionDenied => VfsErrorKind::PermissionDenied,
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut => {
                    VfsErrorKind::Transient
                }
                _ => VfsErrorKind::Fatal,
            },
            VfsError::Fatal(_)
            | VfsError::NotSupported(_)
            | VfsError::InvalidPath(_) => VfsErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == VfsErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == VfsErrorKind::Transient
    }

    /// Map an HTTP status from an object store REST API onto an error
    pub(crate) fn from_status(status: u16, what: impl Into<String>) -> Self {
        let what = what.into();
        match status {
            404 => VfsError::NotFound(what),
            401 | 403 => VfsError::PermissionDenied(what),
            409 | 412 => VfsError::AlreadyExists(what),
            408 | 429 | 500..=599 => VfsError::Transient(format!("{} (HTTP {})", what, status)),
            _ => VfsError::Fatal(format!("{} (HTTP {})", what, status)),
        }
    }
}

impl From<reqwest::Error> for VfsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            VfsError::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            VfsError::from_status(status.as_u16(), e.to_string())
        } else {
            VfsError::Fatal(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let e = VfsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(e.is_not_found());

        let e = VfsError::Io(std::io::Error::from(std::io::ErrorKind::AlreadyExists));
        assert_eq!(e.kind(), VfsErrorKind::AlreadyExists);
    }

    #[test]
    fn test_status_mapping() {
        assert!(VfsError::from_status(404, "x").is_not_found());
        assert!(VfsError::from_status(503, "x").is_transient());
        assert_eq!(VfsError::from_status(412, "x").kind(), VfsErrorKind::AlreadyExists);
        assert_eq!(VfsError::from_status(403, "x").kind(), VfsErrorKind::PermissionDenied);
        assert_eq!(VfsError::from_status(400, "x").kind(), VfsErrorKind::Fatal);
    }
}
