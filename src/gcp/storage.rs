use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

use crate::adapters::{AdapterResult, BlobStore, ByteStream, ObjectInfo};
use crate::errors::AdapterError;

fn generate_client_config(project_id: &str) -> ClientConfig {
    let project_id = Some(project_id.to_string());
    ClientConfig {
        project_id,
        ..Default::default()
    }
}

/// Backup artifacts in one Cloud Storage bucket.
pub struct GcsBlobStore {
    client: Client,
    bucket: String,
}

impl GcsBlobStore {
    /// Creates a client authenticated with the ambient credentials.
    ///
    /// # Errors
    ///
    /// Returns a `GcsError` if the client cannot be initialized.
    pub async fn new(project_id: &str, bucket: &str) -> Result<Self, GcsError> {
        let config = generate_client_config(project_id)
            .with_auth()
            .await
            .map_err(|e| GcsError::TokenSource(Box::new(e)))?;
        Ok(Self {
            client: Client::new(config),
            bucket: bucket.to_string(),
        })
    }
}

fn object_info(object: Object) -> ObjectInfo {
    let created = object
        .time_created
        .and_then(|t| Utc.timestamp_opt(t.unix_timestamp(), t.nanosecond()).single())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let updated = object
        .updated
        .and_then(|t| Utc.timestamp_opt(t.unix_timestamp(), t.nanosecond()).single())
        .unwrap_or(created);
    ObjectInfo {
        name: object.name,
        size: u64::try_from(object.size).unwrap_or(0),
        created,
        updated,
        metadata: object.metadata.unwrap_or_default(),
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn upload(
        &self,
        name: &str,
        content_type: &str,
        size: Option<u64>,
        metadata: HashMap<String, String>,
        data: ByteStream,
    ) -> AdapterResult<ObjectInfo> {
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let object = Object {
            name: name.to_string(),
            content_type: Some(content_type.to_string()),
            metadata: Some(metadata),
            ..Default::default()
        };
        debug!("uploading gs://{}/{} ({:?} bytes)", self.bucket, name, size);
        let uploaded = self
            .client
            .upload_streamed_object(&request, data, &UploadType::Multipart(Box::new(object)))
            .await?;
        if let Some(expected) = size {
            if u64::try_from(uploaded.size).ok() != Some(expected) {
                return Err(AdapterError::UnexpectedResponse(format!(
                    "gs://{}/{} has {} bytes, expected {}",
                    self.bucket, name, uploaded.size, expected
                )));
            }
        }
        info!("uploaded gs://{}/{}", self.bucket, name);
        Ok(object_info(uploaded))
    }

    async fn list(&self, prefix: &str) -> AdapterResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut page_token = None;
        loop {
            let response = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: Some(prefix.to_string()),
                    page_token: page_token.take(),
                    ..Default::default()
                })
                .await?;
            objects.extend(response.items.unwrap_or_default().into_iter().map(object_info));
            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn stat(&self, name: &str) -> AdapterResult<ObjectInfo> {
        let object = self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(object_info(object))
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: name.to_string(),
                ..Default::default()
            })
            .await?;
        info!("deleted gs://{}/{}", self.bucket, name);
        Ok(())
    }

    async fn signed_url(&self, name: &str, expires_in: Duration) -> AdapterResult<String> {
        let options = SignedURLOptions {
            method: SignedURLMethod::GET,
            expires: expires_in,
            ..Default::default()
        };
        self.client
            .signed_url(&self.bucket, name, None, None, options)
            .await
            .map_err(|e| AdapterError::SignedUrl(e.to_string()))
    }

    fn storage_url(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_conversion() {
        let object = Object {
            name: "postgres/postgres-backup-x.sql.gz".to_string(),
            size: 2048,
            metadata: Some(HashMap::from([(
                "database".to_string(),
                "postgres".to_string(),
            )])),
            ..Default::default()
        };
        let info = object_info(object);
        assert_eq!(info.size, 2048);
        // timestamps missing from the response fall back to the epoch
        assert_eq!(info.created, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(info.updated, info.created);
        assert_eq!(info.metadata["database"], "postgres");
    }
}
