//! Issued certificates and generated secrets

use super::types;
use crate::changes::Changes;
use crate::context::Context;
use crate::error::{FiError, Result};
use crate::task::{FieldPolicy, Task};
use async_trait::async_trait;
use kopsflow_pki::{CertType, IssueRequest, Secret, SecretStore, Subject};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// A leaf certificate issued by one of the cluster CAs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypair {
    /// Keyset the certificate is stored in
    pub name: String,
    pub common_name: String,
    pub organizations: Vec<String>,
    pub cert_type: CertType,
    /// Sorted
    pub alternate_names: Vec<String>,
    /// CA keyset that signs the certificate
    pub signer: String,
}

impl Keypair {
    pub fn new(name: impl Into<String>, common_name: impl Into<String>, cert_type: CertType, signer: &str) -> Self {
        Self {
            name: name.into(),
            common_name: common_name.into(),
            organizations: Vec::new(),
            cert_type,
            alternate_names: Vec::new(),
            signer: signer.to_string(),
        }
    }

    pub fn with_alternate_names(mut self, mut names: Vec<String>) -> Self {
        names.sort();
        names.dedup();
        self.alternate_names = names;
        self
    }

    pub fn with_organizations(mut self, organizations: Vec<String>) -> Self {
        self.organizations = organizations;
        self
    }
}

#[async_trait]
impl Task for Keypair {
    crate::task_identity!(types::KEYPAIR);

    fn is_cloud_task(&self) -> bool {
        false
    }

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            // Not recoverable from the stored certificate.
            "certType" | "signer" | "organizations" => FieldPolicy::NotManaged,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        let Some(keyset) = ctx.keystore.find_keyset(&self.name).await? else {
            return Ok(None);
        };
        let Some(primary) = keyset.primary() else {
            return Ok(None);
        };
        let mut alternate_names = primary.certificate.alternate_names()?;
        alternate_names.sort();
        alternate_names.dedup();
        Ok(Some(json!({
            "id": primary.id,
            "name": self.name,
            "commonName": primary.certificate.common_name()?,
            "alternateNames": alternate_names,
        })))
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        _expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        if actual.is_some() {
            tracing::info!(
                "Reissuing {} ({})",
                self.name,
                changes.field_names().join(", ")
            );
            ctx.keystore.delete_keyset(&self.name).await?;
        }
        let item = ctx
            .keystore
            .issue(&IssueRequest {
                keyset: self.name.clone(),
                signer: Some(self.signer.clone()),
                cert_type: self.cert_type,
                subject: Subject {
                    common_name: self.common_name.clone(),
                    organizations: self.organizations.clone(),
                },
                alternate_names: self.alternate_names.clone(),
                validity_days: None,
                primary: true,
            })
            .await?;
        Ok(json!({ "id": item.id }))
    }
}

/// A random token stored under a name, never rotated by apply
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedSecret {
    pub name: String,
}

impl GeneratedSecret {
    fn store<'a>(&self, ctx: &'a Context) -> Result<&'a Arc<dyn SecretStore>> {
        ctx.secret_store
            .as_ref()
            .ok_or(FiError::NotConfigured("secret store"))
    }
}

#[async_trait]
impl Task for GeneratedSecret {
    crate::task_identity!(types::SECRET);

    fn is_cloud_task(&self) -> bool {
        false
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        let found = self.store(ctx)?.find_secret(&self.name).await?;
        Ok(found.map(|_| json!({ "id": self.name, "name": self.name })))
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        _expected: &Value,
        _actual: Option<&Value>,
        _changes: &Changes,
    ) -> Result<Value> {
        let (_, created) = self
            .store(ctx)?
            .get_or_create_secret(&self.name, Secret::generate())
            .await?;
        if created {
            tracing::info!("Created secret {}", self.name);
        }
        Ok(json!({ "id": self.name }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::executor::Executor;
    use crate::target::Target;
    use crate::taskmap::TaskMap;
    use kopsflow_pki::{EphemeralKeystore, Keystore, VfsSecretStore, names};
    use kopsflow_vfs::{MemFs, VfsPath};

    async fn keystore() -> Arc<EphemeralKeystore> {
        let keystore = Arc::new(EphemeralKeystore::new());
        keystore.ensure_ca_keyset(names::KUBERNETES_CA).await.unwrap();
        keystore
    }

    fn apiserver(alternate_names: &[&str]) -> Keypair {
        Keypair::new("kubernetes-master", "kubernetes-master", CertType::Server, names::KUBERNETES_CA)
            .with_alternate_names(alternate_names.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_keypair_issued_once_and_reissued_on_new_names() {
        let keystore = keystore().await;
        let ctx = || Arc::new(Context::new("a.example.com", Target::Direct, keystore.clone()));

        let mut map = TaskMap::new();
        map.add(apiserver(&["api.a.example.com", "kubernetes"])).unwrap();
        let report = Executor::new().run(&map, ctx()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        let first = keystore.get_keyset("kubernetes-master").await.unwrap();

        let report = Executor::new().run(&map, ctx()).await.unwrap();
        assert!(!report.has_changes());

        let mut map = TaskMap::new();
        map.add(apiserver(&["api.a.example.com", "api.internal.a.example.com", "kubernetes"]))
            .unwrap();
        let report = Executor::new().run(&map, ctx()).await.unwrap();
        assert_eq!(report.actions_by_type(ActionType::Update).len(), 1);
        let second = keystore.get_keyset("kubernetes-master").await.unwrap();
        assert_ne!(first.primary_id(), second.primary_id());
        assert_eq!(second.items().len(), 1);
    }

    #[tokio::test]
    async fn test_secret_created_once() {
        let root = VfsPath::new(Arc::new(MemFs::new()), "a.example.com");
        let store: Arc<dyn SecretStore> = Arc::new(VfsSecretStore::new(&root));
        let ctx = || {
            Arc::new(
                Context::new("a.example.com", Target::Direct, Arc::new(EphemeralKeystore::new()))
                    .with_secret_store(store.clone()),
            )
        };
        let mut map = TaskMap::new();
        map.add(GeneratedSecret { name: "kube".into() }).unwrap();

        Executor::new().run(&map, ctx()).await.unwrap();
        let token = store.get_secret("kube").await.unwrap();

        let report = Executor::new().run(&map, ctx()).await.unwrap();
        assert!(!report.has_changes());
        assert_eq!(store.get_secret("kube").await.unwrap(), token);
    }
}
