//! Object store backend (S3 buckets, Azure blob containers)
//!
//! Listing uses object metadata, so units are ordered by last-modified time.
//! Object bodies are streamed and bridged into a blocking reader; nothing is
//! buffered whole.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::io::Read;
use std::sync::Arc;
use tokio_util::io::{StreamReader, SyncIoBridge};

use super::{SourceBackend, SourceUnit};
use crate::error::{CollectorError, CollectorResult};

const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Tracking logs stored as objects
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wrap an existing object store
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// Backend over an S3 bucket
    ///
    /// # Errors
    ///
    /// Returns a source error if the client cannot be built
    pub fn s3(
        bucket: &str,
        access_key_id: &str,
        secret_access_key: &str,
        region: Option<&str>,
    ) -> CollectorResult<Self> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(region.unwrap_or(DEFAULT_AWS_REGION))
            .with_access_key_id(access_key_id)
            .with_secret_access_key(secret_access_key)
            .build()
            .map_err(|e| CollectorError::source("s3", format!("bucket {bucket}: {e}")))?;

        Ok(Self::new("s3", Arc::new(store)))
    }

    /// Backend over an Azure blob container
    ///
    /// # Errors
    ///
    /// Returns a source error if the client cannot be built
    pub fn azure(account: &str, access_key: &str, container: &str) -> CollectorResult<Self> {
        let store = MicrosoftAzureBuilder::new()
            .with_account(account)
            .with_access_key(access_key)
            .with_container_name(container)
            .build()
            .map_err(|e| {
                CollectorError::source("azure-blob", format!("container {container}: {e}"))
            })?;

        Ok(Self::new("azure-blob", Arc::new(store)))
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> CollectorError {
        CollectorError::source(self.name.clone(), reason.to_string())
    }
}

#[async_trait]
impl SourceBackend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> CollectorResult<Vec<SourceUnit>> {
        let mut stream = self.store.list(None);
        let mut units = Vec::new();

        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| self.unavailable(e))?;
            units.push(SourceUnit {
                name: meta.location.to_string(),
                created: meta.last_modified,
                size: meta.size,
            });
        }

        Ok(units)
    }

    async fn open(&self, unit: &SourceUnit) -> CollectorResult<Box<dyn Read + Send>> {
        let location = ObjectPath::from(unit.name.as_str());
        let body = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.unavailable(format!("cannot open {}: {}", unit.name, e)))?
            .into_stream()
            .map_err(std::io::Error::other);

        Ok(Box::new(SyncIoBridge::new(StreamReader::new(body))))
    }
}
