//! kopsflow PKI
//!
//! Keysets of CA and leaf certificates, plus the other per-cluster
//! credentials that live in the state store: named secrets and the admin
//! SSH public key.
//!
//! A keyset holds several items during a CA rotation. Exactly one item is
//! primary and signs new certificates; the others stay trusted until they
//! are distrusted and removed.

pub mod cert;
pub mod error;
pub mod keyset;
pub mod keystore;
pub mod secrets;
pub mod serial;
pub mod ssh;

pub use cert::{CertType, Certificate, IssueCertRequest, PrivateKey, Signer, Subject};
pub use error::{PkiError, Result};
pub use keyset::{Keyset, KeysetItem, compare_ids};
pub use keystore::{EphemeralKeystore, IssueRequest, Keystore, VfsKeystore, names};
pub use secrets::{Secret, SecretStore, VfsSecretStore};
pub use serial::SerialAllocator;
pub use ssh::{SshCredentialStore, SshPublicKey};
