//! API model
//!
//! Every stored object is an envelope of `apiVersion`, `kind`, `metadata`
//! and `spec`; the codec in [`crate::codec`] owns the envelope, these types
//! own the payload.

mod cluster;
mod instancegroup;
mod meta;
mod provider;

pub use cluster::*;
pub use instancegroup::*;
pub use meta::*;
pub use provider::*;
