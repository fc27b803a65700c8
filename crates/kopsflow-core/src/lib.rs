//! kopsflow core
//!
//! The desired-state registry: cluster and instance group objects, their
//! versioned codec, default completion and validation, and the clientset
//! that persists them under a vfs root:
//!
//! ```text
//! <state>/<cluster>/config
//! <state>/<cluster>/status
//! <state>/<cluster>/instancegroup/<name>
//! <state>/<cluster>/secrets/<name>
//! <state>/<cluster>/pki/{issued,private}/<keyset>/...
//! <state>/<cluster>/ssh/public/admin/<fingerprint>
//! <state>/<cluster>/addons/...
//! ```

pub mod channel;
pub mod clientset;
pub mod codec;
pub mod completion;
pub mod error;
pub mod model;
pub mod net;
pub mod validation;

pub use clientset::{AddonsClient, Factory, InstanceGroupClient, VfsClientset};
pub use error::{CoreError, Result};
pub use model::*;
pub use validation::{FieldError, FieldErrorKind, ValidationErrors};
