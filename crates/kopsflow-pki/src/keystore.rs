//! Keyset persistence
//!
//! Layout below the cluster root:
//!
//! ```text
//! pki/private/<name>/keyset.yaml   authoritative: primary id + all items with keys
//! pki/private/<name>/<id>.key      per-item private key (legacy readers)
//! pki/issued/<name>/keyset.yaml    public copy without private material
//! pki/issued/<name>/<id>.crt       per-item certificate
//! ```
//!
//! A store rewrites the per-item files first and commits
//! `pki/private/<name>/keyset.yaml` last in a single write, so a reader
//! never sees a primary id that points at a missing item.

use crate::cert::{
    CertType, Certificate, IssueCertRequest, PrivateKey, Subject, issue_certificate,
};
use crate::error::{PkiError, Result};
use crate::keyset::{Keyset, KeysetItem};
use crate::serial::SerialAllocator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kopsflow_vfs::{Acl, VfsPath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub const KEYSET_API_VERSION: &str = "kops.k8s.io/v1alpha2";
const KEYSET_FILE: &str = "keyset.yaml";

/// Well-known keyset names
pub mod names {
    pub const KUBERNETES_CA: &str = "kubernetes-ca";
    pub const ETCD_MANAGER_CA_MAIN: &str = "etcd-manager-ca-main";
    pub const ETCD_MANAGER_CA_EVENTS: &str = "etcd-manager-ca-events";
    pub const ETCD_PEERS_CA_MAIN: &str = "etcd-peers-ca-main";
    pub const ETCD_PEERS_CA_EVENTS: &str = "etcd-peers-ca-events";
    pub const ETCD_CLIENTS_CA: &str = "etcd-clients-ca";
    pub const APISERVER_AGGREGATOR_CA: &str = "apiserver-aggregator-ca";
    pub const SERVICE_ACCOUNT: &str = "service-account";
}

/// A request to issue a certificate into a keyset
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Keyset to add the new item to
    pub keyset: String,
    /// Keyset whose primary signs the certificate; `None` self-signs a CA
    pub signer: Option<String>,
    pub cert_type: CertType,
    pub subject: Subject,
    pub alternate_names: Vec<String>,
    pub validity_days: Option<u32>,
    /// Make the new item primary (always true for a new keyset)
    pub primary: bool,
}

/// Storage for keysets
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn find_keyset(&self, name: &str) -> Result<Option<Keyset>>;

    async fn list_keysets(&self) -> Result<Vec<Keyset>>;

    async fn store_keyset(&self, keyset: &Keyset) -> Result<()>;

    /// Remove the whole keyset
    async fn delete_keyset(&self, name: &str) -> Result<()>;

    /// Allocate a fresh serial, above anything already stored
    async fn next_serial(&self) -> Result<String>;

    async fn get_keyset(&self, name: &str) -> Result<Keyset> {
        self.find_keyset(name)
            .await?
            .ok_or_else(|| PkiError::KeysetNotFound(name.to_string()))
    }

    /// Remove one non-primary item
    async fn delete_keyset_item(&self, name: &str, id: &str) -> Result<()> {
        let mut keyset = self.get_keyset(name).await?;
        keyset.remove(id)?;
        self.store_keyset(&keyset).await
    }

    /// Issue a certificate and add it to `request.keyset`
    async fn issue(&self, request: &IssueRequest) -> Result<KeysetItem> {
        let signer = match &request.signer {
            Some(name) => Some(self.get_keyset(name).await?.signer()?),
            None => None,
        };
        // Reading the target first lets the allocator observe its serials
        let mut keyset = self
            .find_keyset(&request.keyset)
            .await?
            .unwrap_or_else(|| Keyset::new(&request.keyset));
        let serial = self.next_serial().await?;
        let (cert, key) = issue_certificate(
            &IssueCertRequest {
                cert_type: request.cert_type,
                subject: request.subject.clone(),
                alternate_names: request.alternate_names.clone(),
                serial,
                private_key: None,
                validity_days: request.validity_days,
            },
            signer.as_ref(),
        )?;
        let item = KeysetItem::new(cert, Some(key))?;
        keyset.add_item(item.clone(), request.primary)?;
        self.store_keyset(&keyset).await?;
        tracing::info!(keyset = %request.keyset, id = %item.id, "Issued certificate");
        Ok(item)
    }

    /// Create a self-signed CA keyset if it does not exist yet
    async fn ensure_ca_keyset(&self, name: &str) -> Result<Keyset> {
        if let Some(existing) = self.find_keyset(name).await? {
            if !existing.is_empty() {
                return Ok(existing);
            }
        }
        self.issue(&IssueRequest {
            keyset: name.to_string(),
            signer: None,
            cert_type: CertType::Ca,
            subject: Subject::cn(name),
            alternate_names: vec![],
            validity_days: None,
            primary: true,
        })
        .await?;
        self.get_keyset(name).await
    }

    /// Import an existing certificate (and optional key) into a keyset
    async fn import_item(
        &self,
        name: &str,
        certificate: Certificate,
        private_key: Option<PrivateKey>,
        primary: bool,
    ) -> Result<KeysetItem> {
        if let Some(key) = &private_key {
            if !certificate.matches_key(key)? {
                return Err(PkiError::InvalidCertificate(
                    "private key does not match certificate".to_string(),
                ));
            }
        }
        let item = KeysetItem::new(certificate, private_key)?;
        let mut keyset = self
            .find_keyset(name)
            .await?
            .unwrap_or_else(|| Keyset::new(name));
        keyset.add_item(item.clone(), primary)?;
        self.store_keyset(&keyset).await?;
        Ok(item)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysetFile {
    api_version: String,
    kind: String,
    metadata: KeysetMetadata,
    spec: KeysetSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeysetMetadata {
    name: String,
    #[serde(
        default,
        rename = "creationTimestamp",
        skip_serializing_if = "Option::is_none"
    )]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysetSpec {
    #[serde(rename = "type")]
    keyset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primary_id: Option<String>,
    #[serde(default)]
    keys: Vec<KeyFile>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    id: String,
    public_material: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distrust_timestamp: Option<DateTime<Utc>>,
}

impl KeysetFile {
    fn from_keyset(keyset: &Keyset, include_private: bool) -> Self {
        Self {
            api_version: KEYSET_API_VERSION.to_string(),
            kind: "Keyset".to_string(),
            metadata: KeysetMetadata {
                name: keyset.name().to_string(),
                creation_timestamp: None,
            },
            spec: KeysetSpec {
                keyset_type: "Keypair".to_string(),
                primary_id: keyset.primary_id().map(str::to_string),
                keys: keyset
                    .items()
                    .iter()
                    .map(|i| KeyFile {
                        id: i.id.clone(),
                        public_material: i.certificate.pem().to_string(),
                        private_material: if include_private {
                            i.private_key.as_ref().map(|k| k.pem().to_string())
                        } else {
                            None
                        },
                        distrust_timestamp: i.distrust_timestamp,
                    })
                    .collect(),
            },
        }
    }

    fn into_keyset(self) -> Result<Keyset> {
        if self.api_version != KEYSET_API_VERSION || self.kind != "Keyset" {
            return Err(PkiError::UnsupportedFormat(format!(
                "{}/{}",
                self.api_version, self.kind
            )));
        }
        let mut items = Vec::with_capacity(self.spec.keys.len());
        for key in self.spec.keys {
            let certificate = Certificate::from_pem(key.public_material)?;
            let private_key = key.private_material.map(PrivateKey::from_pem).transpose()?;
            items.push(KeysetItem {
                id: key.id,
                certificate,
                private_key,
                distrust_timestamp: key.distrust_timestamp,
            });
        }
        Keyset::from_parts(self.metadata.name, self.spec.primary_id, items)
    }
}

/// [`Keystore`] over a cluster's vfs root
#[derive(Debug, Clone)]
pub struct VfsKeystore {
    base: VfsPath,
    serials: Arc<SerialAllocator>,
}

impl VfsKeystore {
    /// `base` is the cluster root (`<state>/<cluster>`)
    pub fn new(base: VfsPath) -> Self {
        Self {
            base,
            serials: Arc::new(SerialAllocator::new()),
        }
    }

    fn private_dir(&self, name: &str) -> VfsPath {
        self.base.join("pki/private").join(name)
    }

    fn issued_dir(&self, name: &str) -> VfsPath {
        self.base.join("pki/issued").join(name)
    }
}

#[async_trait]
impl Keystore for VfsKeystore {
    async fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        let path = self.private_dir(name).join(KEYSET_FILE);
        let Some(data) = path.read_optional().await? else {
            return Ok(None);
        };
        let file: KeysetFile = serde_yaml::from_slice(&data)?;
        let keyset = file.into_keyset()?;
        for item in keyset.items() {
            self.serials.observe(&item.id);
        }
        Ok(Some(keyset))
    }

    async fn list_keysets(&self) -> Result<Vec<Keyset>> {
        let mut names = BTreeSet::new();
        for dir in self.base.join("pki/private").list().await? {
            names.insert(dir.base().to_string());
        }
        let mut keysets = Vec::new();
        for name in names {
            if let Some(keyset) = self.find_keyset(&name).await? {
                keysets.push(keyset);
            }
        }
        Ok(keysets)
    }

    async fn store_keyset(&self, keyset: &Keyset) -> Result<()> {
        keyset.validate()?;
        let name = keyset.name();
        let private_dir = self.private_dir(name);
        let issued_dir = self.issued_dir(name);

        let mut keep = BTreeSet::new();
        for item in keyset.items() {
            self.serials.observe(&item.id);
            keep.insert(item.id.clone());
            issued_dir
                .join(format!("{}.crt", item.id))
                .write(item.certificate.pem().as_bytes(), Acl::Private)
                .await?;
            if let Some(key) = &item.private_key {
                private_dir
                    .join(format!("{}.key", item.id))
                    .write(key.pem().as_bytes(), Acl::Private)
                    .await?;
            }
        }

        let public = serde_yaml::to_string(&KeysetFile::from_keyset(keyset, false))?;
        issued_dir
            .join(KEYSET_FILE)
            .write(public.as_bytes(), Acl::Private)
            .await?;

        let private = serde_yaml::to_string(&KeysetFile::from_keyset(keyset, true))?;
        private_dir
            .join(KEYSET_FILE)
            .write(private.as_bytes(), Acl::Private)
            .await?;

        // Drop per-item files of removed items only after the commit
        for dir in [&issued_dir, &private_dir] {
            for child in dir.list().await? {
                let file = child.base();
                let Some((id, ext)) = file.rsplit_once('.') else {
                    continue;
                };
                if (ext == "crt" || ext == "key") && !keep.contains(id) {
                    child.remove().await?;
                }
            }
        }
        tracing::debug!(keyset = %name, items = keyset.items().len(), "Stored keyset");
        Ok(())
    }

    async fn delete_keyset(&self, name: &str) -> Result<()> {
        // Remove the authoritative file first so a partial delete reads as absent
        let commit = self.private_dir(name).join(KEYSET_FILE);
        match commit.remove().await {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => {}
        }
        self.private_dir(name).remove_all().await?;
        self.issued_dir(name).remove_all().await?;
        Ok(())
    }

    async fn next_serial(&self) -> Result<String> {
        Ok(self.serials.next())
    }
}

/// A keystore held only in memory, used for dry runs against a cluster
/// whose CAs have not been created yet.
#[derive(Debug, Default)]
pub struct EphemeralKeystore {
    keysets: Mutex<BTreeMap<String, Keyset>>,
    serials: SerialAllocator,
}

impl EphemeralKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Keyset>> {
        self.keysets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Keystore for EphemeralKeystore {
    async fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        Ok(self.lock().get(name).cloned())
    }

    async fn list_keysets(&self) -> Result<Vec<Keyset>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn store_keyset(&self, keyset: &Keyset) -> Result<()> {
        keyset.validate()?;
        for item in keyset.items() {
            self.serials.observe(&item.id);
        }
        self.lock()
            .insert(keyset.name().to_string(), keyset.clone());
        Ok(())
    }

    async fn delete_keyset(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }

    async fn next_serial(&self) -> Result<String> {
        Ok(self.serials.next())
    }
}
