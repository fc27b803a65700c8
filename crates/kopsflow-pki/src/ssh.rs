//! SSH public key credentials stored below `<cluster>/ssh/public/admin/`

use crate::error::{PkiError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kopsflow_vfs::{Acl, VfsPath};
use openssl::hash::{MessageDigest, hash};

/// The only user kops manages keys for
pub const ADMIN_USER: &str = "admin";

/// A parsed `ssh-rsa AAAA... comment` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshPublicKey {
    pub algorithm: String,
    blob: Vec<u8>,
    pub comment: Option<String>,
    text: String,
}

impl SshPublicKey {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let mut fields = text.split_whitespace();
        let algorithm = fields
            .next()
            .ok_or_else(|| PkiError::InvalidSshKey("empty key".to_string()))?;
        if !algorithm.starts_with("ssh-") && !algorithm.starts_with("ecdsa-") {
            return Err(PkiError::InvalidSshKey(format!(
                "unknown key type {:?}",
                algorithm
            )));
        }
        let encoded = fields
            .next()
            .ok_or_else(|| PkiError::InvalidSshKey("missing key data".to_string()))?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| PkiError::InvalidSshKey(format!("key data: {}", e)))?;
        let comment = {
            let rest: Vec<&str> = fields.collect();
            (!rest.is_empty()).then(|| rest.join(" "))
        };
        Ok(Self {
            algorithm: algorithm.to_string(),
            blob,
            comment,
            text: text.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// MD5 fingerprint of the key blob, as colon-separated hex
    pub fn fingerprint(&self) -> Result<String> {
        let digest = hash(MessageDigest::md5(), &self.blob)?;
        Ok(digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"))
    }
}

/// Stores at most one admin key per cluster
#[derive(Debug, Clone)]
pub struct SshCredentialStore {
    base: VfsPath,
}

impl SshCredentialStore {
    pub fn new(cluster_root: &VfsPath) -> Self {
        Self {
            base: cluster_root.join("ssh/public").join(ADMIN_USER),
        }
    }

    pub async fn find_ssh_public_keys(&self) -> Result<Vec<SshPublicKey>> {
        let mut keys = Vec::new();
        for path in self.base.list().await? {
            let raw = path.read().await?;
            let text = String::from_utf8(raw)
                .map_err(|e| PkiError::InvalidSshKey(format!("{}: {}", path, e)))?;
            keys.push(SshPublicKey::parse(&text)?);
        }
        Ok(keys)
    }

    /// Store `key`, replacing any existing admin key
    pub async fn add_ssh_public_key(&self, key: &SshPublicKey) -> Result<String> {
        let fingerprint = key.fingerprint()?;
        let file = fingerprint.replace(':', "");
        self.base
            .join(&file)
            .write(key.text().as_bytes(), Acl::Private)
            .await?;
        for existing in self.base.list().await? {
            if existing.base() != file {
                existing.remove().await?;
            }
        }
        tracing::info!(%fingerprint, "Stored SSH public key");
        Ok(fingerprint)
    }

    pub async fn delete_ssh_credentials(&self) -> Result<()> {
        self.base.remove_all().await?;
        Ok(())
    }
}
