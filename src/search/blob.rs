//! Storage of match results, inline or out-of-band.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::common::s3;
use crate::err::BlobError;

use super::worker::MatchResult;

/// Default size above which results are stored out-of-band.
pub const DEFAULT_INLINE_THRESHOLD: usize = 300 * 1024;

/// Key prefix of out-of-band results.
const KEY_PREFIX: &str = "variant-queries";

/// Where out-of-band results are kept.
pub enum BlobStore {
    /// In-process map.
    Memory(Mutex<HashMap<String, Vec<u8>>>),
    /// Files below a directory.
    Local(PathBuf),
    /// Objects in an S3 bucket.
    S3 {
        client: aws_sdk_s3::Client,
        bucket: String,
    },
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobStore::Memory(_) => write!(f, "BlobStore::Memory"),
            BlobStore::Local(path) => write!(f, "BlobStore::Local({:?})", path),
            BlobStore::S3 { bucket, .. } => write!(f, "BlobStore::S3({:?})", bucket),
        }
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        BlobStore::Memory(Mutex::new(HashMap::new()))
    }
}

impl BlobStore {
    /// S3 store if S3 mode is enabled and a bucket is given, else local or memory.
    pub async fn from_env(
        bucket: Option<&str>,
        dir: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        match (bucket, dir) {
            (Some(bucket), _) if s3::s3_mode() => {
                let config = s3::config_from_env().await?;
                tracing::info!("storing large results in S3 bucket {:?}", bucket);
                Ok(BlobStore::S3 {
                    client: aws_sdk_s3::Client::from_conf(config),
                    bucket: bucket.to_string(),
                })
            }
            (_, Some(dir)) => {
                tracing::info!("storing large results below {:?}", dir);
                Ok(BlobStore::Local(PathBuf::from(dir)))
            }
            _ => Ok(BlobStore::default()),
        }
    }

    /// Store `body` under a fresh key and return the key.
    pub async fn put(&self, body: Vec<u8>) -> Result<String, BlobError> {
        let key = format!("{}/{}.json", KEY_PREFIX, uuid::Uuid::new_v4());
        match self {
            BlobStore::Memory(map) => {
                map.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone(), body);
            }
            BlobStore::Local(dir) => {
                let path = dir.join(&key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, body).await?;
            }
            BlobStore::S3 { client, bucket } => {
                s3::put_bytes(client, bucket, &key, body)
                    .await
                    .map_err(|e| BlobError::S3(e.to_string()))?;
            }
        }
        Ok(key)
    }

    /// Load the blob stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        match self {
            BlobStore::Memory(map) => map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(key)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(key.to_string())),
            BlobStore::Local(dir) => match tokio::fs::read(dir.join(key)).await {
                Ok(body) => Ok(body),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(BlobError::NotFound(key.to_string()))
                }
                Err(e) => Err(e.into()),
            },
            BlobStore::S3 { client, bucket } => s3::get_bytes(client, bucket, key)
                .await
                .map_err(|e| BlobError::S3(e.to_string())),
        }
    }

    /// Remove the blob under `key`; missing blobs are ignored.
    pub async fn delete(&self, key: &str) -> Result<(), BlobError> {
        match self {
            BlobStore::Memory(map) => {
                map.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
            }
            BlobStore::Local(dir) => match tokio::fs::remove_file(dir.join(key)).await {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            },
            BlobStore::S3 { client, bucket } => {
                s3::delete_key(client, bucket, key)
                    .await
                    .map_err(|e| BlobError::S3(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// A stored match result as kept in the job record.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum StoredResponse {
    /// Serialized result.
    Inline(String),
    /// Key of the out-of-band result.
    Blob(String),
}

impl StoredResponse {
    /// Serialize `result`, moving it out-of-band if larger than `threshold` bytes.
    pub async fn store(
        result: &MatchResult,
        blobs: &BlobStore,
        threshold: usize,
    ) -> Result<Self, BlobError> {
        let body = serde_json::to_string(result)?;
        if body.len() > threshold {
            tracing::debug!(
                "result of {} bytes for {} exceeds inline threshold",
                body.len(),
                &result.vcf_location
            );
            Ok(StoredResponse::Blob(blobs.put(body.into_bytes()).await?))
        } else {
            Ok(StoredResponse::Inline(body))
        }
    }

    /// Load the match result, dereferencing blobs.
    pub async fn load(&self, blobs: &BlobStore) -> Result<MatchResult, BlobError> {
        match self {
            StoredResponse::Inline(body) => Ok(serde_json::from_str(body)?),
            StoredResponse::Blob(key) => Ok(serde_json::from_slice(&blobs.get(key).await?)?),
        }
    }
}
