//! kopsflow virtual filesystem
//!
//! A uniform path abstraction over the places a cluster registry can live:
//! S3, GCS, Azure blob storage, the local filesystem and memory.
//!
//! ```text
//! VfsContext::build_path("s3://bucket/clusters")
//!        │
//!        ▼
//!   VfsPath ──► dyn ObjectStore ──► { MemFs | LocalFs | S3Store | GcsStore | AzureBlobStore }
//! ```
//!
//! `write_file_if_not_exists` is at-most-once: every backend maps it onto a
//! native precondition (`O_EXCL`, `If-None-Match: *`, `ifGenerationMatch=0`).

pub mod azure;
pub mod context;
pub mod error;
pub mod fs;
pub mod gcs;
pub mod memfs;
pub mod path;
#[cfg(feature = "aws")]
pub mod s3;
pub mod store;

pub use context::VfsContext;
pub use error::{Result, VfsError, VfsErrorKind};
pub use fs::LocalFs;
pub use memfs::MemFs;
pub use path::VfsPath;
pub use store::{Acl, Hash, HashAlgorithm, ObjectStore};
