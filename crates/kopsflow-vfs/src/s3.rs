//! S3 backend (feature `aws`)

use crate::error::{Result, VfsError};
use crate::store::{Acl, Hash, ObjectStore};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;

#[derive(Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the default AWS credential chain
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn map_err<E>(&self, e: SdkError<E, HttpResponse>, key: &str) -> VfsError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let status = e.raw_response().map(|r| r.status().as_u16());
        match (&e, status) {
            (SdkError::TimeoutError(_), _) | (SdkError::DispatchFailure(_), _) => {
                VfsError::Transient(format!("{}: {}", self.describe(key), e))
            }
            (_, Some(code)) => {
                let detail = e.message().unwrap_or("request failed").to_string();
                VfsError::from_status(code, format!("{}: {}", self.describe(key), detail))
            }
            _ => VfsError::Fatal(format!("{}: {}", self.describe(key), e)),
        }
    }

    async fn put(&self, key: &str, data: &[u8], acl: Acl, if_absent: bool) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()));
        if acl == Acl::PublicRead {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }
        if if_absent {
            request = request.if_none_match("*");
        }
        request.send().await.map_err(|e| self.map_err(e, key))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    fn root(&self) -> &str {
        &self.bucket
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(e, key))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| VfsError::Transient(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn write(&self, key: &str, data: &[u8], acl: Acl) -> Result<()> {
        self.put(key, data, acl, false).await
    }

    async fn create_new(&self, key: &str, data: &[u8], acl: Acl) -> Result<()> {
        self.put(key, data, acl, true).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.clone())
                .send()
                .await
                .map_err(|e| self.map_err(e, prefix))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(|k| k.to_string())),
            );
            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(e, key))?;
        Ok(())
    }

    async fn hash(&self, key: &str) -> Result<Hash> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(e, key))?;
        let etag = output
            .e_tag()
            .map(|t| t.trim_matches('"').to_string())
            .ok_or_else(|| VfsError::NotSupported(format!("no etag for {}", self.describe(key))))?;
        if etag.contains('-') {
            // multipart etags are not content hashes
            return Err(VfsError::NotSupported(format!(
                "multipart object {}",
                self.describe(key)
            )));
        }
        Ok(Hash::md5_hex(etag))
    }
}
