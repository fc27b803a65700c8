//! Google Cloud Storage backend (JSON API)

use crate::error::{Result, VfsError};
use crate::store::{Acl, Hash, ObjectStore};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Url;
use serde::Deserialize;

const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// Objects in a GCS bucket
#[derive(Debug)]
pub struct GcsStore {
    client: reqwest::Client,
    bucket: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMeta>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    md5_hash: Option<String>,
}

impl GcsStore {
    /// Create a store; the bearer token is taken from `GOOGLE_OAUTH_ACCESS_TOKEN`
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: bucket.into(),
            token: std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok(),
        }
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        let mut url = Url::parse(GCS_API_BASE).map_err(|e| VfsError::Fatal(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| VfsError::Fatal("invalid GCS base url".to_string()))?
            .extend(["storage", "v1", "b", &self.bucket, "o", key]);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn upload(&self, key: &str, data: &[u8], acl: Acl, if_absent: bool) -> Result<()> {
        let mut url = Url::parse(GCS_API_BASE).map_err(|e| VfsError::Fatal(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| VfsError::Fatal("invalid GCS base url".to_string()))?
            .extend(["upload", "storage", "v1", "b", &self.bucket, "o"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media");
            query.append_pair("name", key);
            if acl == Acl::PublicRead {
                query.append_pair("predefinedAcl", "publicRead");
            }
            if if_absent {
                // generation 0 means "object must not exist"
                query.append_pair("ifGenerationMatch", "0");
            }
        }

        let response = self
            .request(reqwest::Method::POST, url)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(VfsError::from_status(status, self.describe(key)));
        }
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn scheme(&self) -> &'static str {
        "gs"
    }

    fn root(&self) -> &str {
        &self.bucket
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write(&self, key: &str, data: &[u8], acl: Acl) -> Result<()> {
        self.upload(key, data, acl, false).await
    }

    async fn create_new(&self, key: &str, data: &[u8], acl: Acl) -> Result<()> {
        self.upload(key, data, acl, true).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = Url::parse(GCS_API_BASE).map_err(|e| VfsError::Fatal(e.to_string()))?;
            url.path_segments_mut()
                .map_err(|_| VfsError::Fatal("invalid GCS base url".to_string()))?
                .extend(["storage", "v1", "b", &self.bucket, "o"]);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self.request(reqwest::Method::GET, url).send().await?;
            if !response.status().is_success() {
                return Err(VfsError::from_status(
                    response.status().as_u16(),
                    self.describe(prefix),
                ));
            }
            let page: ObjectList = response.json().await?;
            keys.extend(page.items.into_iter().map(|i| i.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let url = self.object_url(key)?;
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        Ok(())
    }

    async fn hash(&self, key: &str) -> Result<Hash> {
        let url = self.object_url(key)?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(VfsError::from_status(
                response.status().as_u16(),
                self.describe(key),
            ));
        }
        let meta: ObjectMeta = response.json().await?;
        let encoded = meta
            .md5_hash
            .ok_or_else(|| VfsError::NotSupported(format!("no md5 for {}", self.describe(key))))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VfsError::Fatal(e.to_string()))?;
        Ok(Hash::md5_hex(hex::encode(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_escapes_slashes() {
        let store = GcsStore::new("state-bucket");
        let url = store.object_url("c1/pki/private/ca/keyset.yaml").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/state-bucket/o/c1%2Fpki%2Fprivate%2Fca%2Fkeyset.yaml"
        );
    }
}
