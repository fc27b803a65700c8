//! Azure blob storage backend (REST API with a SAS token)

use crate::error::{Result, VfsError};
use crate::store::{Acl, Hash, ObjectStore};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Url;

#[derive(Debug)]
pub struct AzureBlobStore {
    client: reqwest::Client,
    account: String,
    container: String,
    sas_token: Option<String>,
}

impl AzureBlobStore {
    /// Account name from `AZURE_STORAGE_ACCOUNT`, SAS token from `AZURE_STORAGE_SAS_TOKEN`
    pub fn from_env(container: impl Into<String>) -> Result<Self> {
        let account = std::env::var("AZURE_STORAGE_ACCOUNT").map_err(|_| {
            VfsError::PermissionDenied("AZURE_STORAGE_ACCOUNT is not set".to_string())
        })?;
        Ok(Self::new(
            account,
            container,
            std::env::var("AZURE_STORAGE_SAS_TOKEN").ok(),
        ))
    }

    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        sas_token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            account: account.into(),
            container: container.into(),
            sas_token: sas_token.map(|t| t.trim_start_matches('?').to_string()),
        }
    }

    fn base_url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("https://{}.blob.core.windows.net", self.account))
            .map_err(|e| VfsError::Fatal(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| VfsError::Fatal("invalid azure url".to_string()))?
            .push(&self.container);
        if let Some(sas) = &self.sas_token {
            url.set_query(Some(sas));
        }
        Ok(url)
    }

    fn blob_url(&self, key: &str) -> Result<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| VfsError::Fatal("invalid azure url".to_string()))?
            .extend(key.split('/'));
        Ok(url)
    }

    fn describe(&self, key: &str) -> String {
        format!("azureblob://{}/{}", self.container, key)
    }

    async fn put(&self, key: &str, data: &[u8], if_absent: bool) -> Result<()> {
        let mut request = self
            .client
            .put(self.blob_url(key)?)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", "2021-08-06")
            .body(data.to_vec());
        if if_absent {
            request = request.header("If-None-Match", "*");
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        Ok(())
    }
}

/// Pull the text of every `<tag>` element out of a list-blobs response
fn extract_elements(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn scheme(&self) -> &'static str {
        "azureblob"
    }

    fn root(&self) -> &str {
        &self.container
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.blob_url(key)?)
            .header("x-ms-version", "2021-08-06")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        // ACLs are container-level in azure
        self.put(key, data, false).await
    }

    async fn create_new(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        self.put(key, data, true).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.base_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("restype", "container");
                query.append_pair("comp", "list");
                query.append_pair("prefix", prefix);
                if let Some(m) = &marker {
                    query.append_pair("marker", m);
                }
            }
            let response = self
                .client
                .get(url)
                .header("x-ms-version", "2021-08-06")
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(VfsError::from_status(
                    response.status().as_u16(),
                    self.describe(prefix),
                ));
            }
            let body = response.text().await?;
            keys.extend(extract_elements(&body, "Name"));
            marker = extract_elements(&body, "NextMarker")
                .into_iter()
                .find(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.blob_url(key)?)
            .header("x-ms-version", "2021-08-06")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        Ok(())
    }

    async fn hash(&self, key: &str) -> Result<Hash> {
        let response = self
            .client
            .head(self.blob_url(key)?)
            .header("x-ms-version", "2021-08-06")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        let encoded = response
            .headers()
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| VfsError::NotSupported(format!("no md5 for {}", self.describe(key))))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VfsError::Fatal(e.to_string()))?;
        Ok(Hash::md5_hex(hex::encode(raw)))
    }
}
