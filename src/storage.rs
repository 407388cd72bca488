//! Object storage abstraction.
//!
//! Everything above this module speaks [`ObjectStore`]; the backend is an
//! `opendal` operator picked by configuration. Production deployments use
//! one of the two bucket-based stores (S3 or GCS); the filesystem backend
//! exists for tests and single-machine development. All writes are
//! idempotent overwrites.

use crate::error::PipelineError;
use opendal::layers::RetryLayer;
use opendal::services::{Fs, Gcs, S3};
use opendal::Operator;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::compat::FuturesAsyncWriteCompatExt;
use tracing::info;

#[derive(Clone, Debug)]
pub enum StorageBackend {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
    Gcs {
        bucket: String,
        credential: Option<String>,
    },
}

/// Uniform object operations over the configured backend.
#[derive(Clone)]
pub struct ObjectStore {
    operator: Operator,
    bucket: String,
}

impl ObjectStore {
    pub fn new(backend: &StorageBackend) -> Result<Self, PipelineError> {
        let (operator, bucket) = match backend {
            StorageBackend::Local { root } => {
                info!(root = %root.display(), "using local filesystem storage");
                let builder = Fs::default().root(&root.to_string_lossy());
                (
                    Operator::new(builder)?.finish(),
                    root.to_string_lossy().into_owned(),
                )
            }
            StorageBackend::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => {
                info!(%bucket, ?region, "using S3 storage");
                let mut builder = S3::default()
                    .bucket(bucket)
                    .access_key_id(access_key_id)
                    .secret_access_key(secret_access_key);
                if let Some(region) = region {
                    builder = builder.region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.endpoint(endpoint);
                }
                (
                    Operator::new(builder)?
                        .layer(RetryLayer::new().with_max_times(3))
                        .finish(),
                    bucket.clone(),
                )
            }
            StorageBackend::Gcs { bucket, credential } => {
                info!(%bucket, "using GCS storage");
                let mut builder = Gcs::default().bucket(bucket);
                if let Some(credential) = credential {
                    builder = builder.credential(credential);
                }
                (
                    Operator::new(builder)?
                        .layer(RetryLayer::new().with_max_times(3))
                        .finish(),
                    bucket.clone(),
                )
            }
        };

        Ok(Self { operator, bucket })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Streams a local file into the store. Returns the bytes written.
    pub async fn put_file(
        &self,
        key: &str,
        file: &Path,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<u64, PipelineError> {
        let mut reader = tokio::fs::File::open(file)
            .await
            .map_err(|err| PipelineError::Transport(format!("open {}: {err}", file.display())))?;

        let mut writer = self.operator.writer_with(key).content_type(content_type);
        if let Some(cache_control) = cache_control {
            writer = writer.cache_control(cache_control);
        }
        let mut writer = writer.await?.into_futures_async_write().compat_write();

        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|err| PipelineError::Transport(format!("copy to {key}: {err}")))?;
        writer
            .shutdown()
            .await
            .map_err(|err| PipelineError::Transport(format!("finish {key}: {err}")))?;
        Ok(copied)
    }

    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        self.operator
            .write_with(key, bytes)
            .content_type(content_type)
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let buffer = self.operator.read(key).await?;
        Ok(buffer.to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.operator.delete(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, PipelineError> {
        Ok(self.operator.exists(key).await?)
    }

    /// Issues a time-limited read URL for downstream playback clients.
    pub async fn presign_read(&self, key: &str, expiry: Duration) -> Result<String, PipelineError> {
        let request = self.operator.presign_read(key, expiry).await?;
        Ok(request.uri().to_string())
    }

    /// Issues a time-limited upload URL; recorded for collaborators, unused
    /// by the pipeline itself.
    pub async fn presign_write(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<String, PipelineError> {
        let request = self.operator.presign_write(key, expiry).await?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_store(dir: &Path) -> ObjectStore {
        ObjectStore::new(&StorageBackend::Local {
            root: dir.to_path_buf(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn bytes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());

        store
            .put_bytes("a/b/chunk_00000000.webm", b"media".to_vec(), "video/webm")
            .await
            .unwrap();
        assert!(store.exists("a/b/chunk_00000000.webm").await.unwrap());
        assert_eq!(store.get("a/b/chunk_00000000.webm").await.unwrap(), b"media");

        store.delete("a/b/chunk_00000000.webm").await.unwrap();
        assert!(!store.exists("a/b/chunk_00000000.webm").await.unwrap());
    }

    #[tokio::test]
    async fn file_upload_reports_length_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());

        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("segment_00000.ts");
        tokio::fs::write(&path, vec![7u8; 1024]).await.unwrap();

        let written = store
            .put_file("hls/segment_00000.ts", &path, "video/mp2t", None)
            .await
            .unwrap();
        assert_eq!(written, 1024);

        // Same inputs, same object: overwrite is not an error.
        let written = store
            .put_file("hls/segment_00000.ts", &path, "video/mp2t", None)
            .await
            .unwrap();
        assert_eq!(written, 1024);
        assert_eq!(store.get("hls/segment_00000.ts").await.unwrap().len(), 1024);
    }
}
