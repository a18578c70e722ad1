use super::ArchivePurger;
use crate::core::{AccountDescriptor, Clock, FlowlogError, Result, Timestamp};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{Level, event, info};
use uuid::Uuid;

const OBJECT_TIME_FORMAT: &str = "%d_%m_%Y-%H_%M";
const OBJECT_TIME_LEN: usize = 16;

/// Archive key of the window starting at `window_start`.
pub fn object_key(bucket: &str, window_start: &Timestamp) -> String {
    format!("{}-{}", bucket, window_start.format(OBJECT_TIME_FORMAT))
}

/// Window start encoded in the tail of an archive key.
pub fn object_time(key: &str) -> Option<Timestamp> {
    let split = key.len().checked_sub(OBJECT_TIME_LEN)?;
    let suffix = key.get(split..)?;
    NaiveDateTime::parse_from_str(suffix, OBJECT_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether the object behind `key` has outlived `retention`. Keys without a
/// readable time are never considered expired.
pub fn is_expired(key: &str, now: Timestamp, retention: Duration) -> bool {
    object_time(key).is_some_and(|created| created <= now - retention)
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(FlowlogError::Archive(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

/// Object archive laid out as one directory per bucket.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            retention,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        validate_name("bucket", bucket)?;
        Ok(self.root.join(bucket))
    }

    /// Creates the bucket if needed. Repeating it is harmless.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir).await.map_err(|err| {
            FlowlogError::Archive(format!(
                "Failed to create bucket '{}': {}",
                dir.display(),
                err
            ))
        })?;
        Ok(dir)
    }

    /// Stores `body` under `key`, replacing any previous object atomically.
    pub async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        validate_name("object", key)?;
        let dir = self.ensure_bucket(bucket).await?;
        let path = dir.join(key);
        let tmp = dir.join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));
        fs::write(&tmp, body).await.map_err(|err| {
            FlowlogError::Archive(format!(
                "Failed to write temp file '{}': {}",
                tmp.display(),
                err
            ))
        })?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(FlowlogError::Archive(format!(
                "Failed to rename temp file '{}' -> '{}': {}",
                tmp.display(),
                path.display(),
                err
            )));
        }
        event!(Level::INFO, bucket, key, bytes = body.len(), "archive object stored");
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        validate_name("object", key)?;
        let path = self.bucket_dir(bucket)?.join(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FlowlogError::Archive(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    /// Keys stored in `bucket`, or `None` if the bucket was never created.
    pub async fn list_objects(&self, bucket: &str) -> Result<Option<Vec<String>>> {
        let dir = self.bucket_dir(bucket)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(FlowlogError::Archive(format!(
                    "Failed to list '{}': {}",
                    dir.display(),
                    err
                )));
            }
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            FlowlogError::Archive(format!("Failed to list '{}': {}", dir.display(), err))
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(Some(keys))
    }
}

#[async_trait]
impl ArchivePurger for FsArchive {
    async fn purge_old_objects(&self, account: &AccountDescriptor) -> Result<usize> {
        let bucket = account.bucket_name.as_str();
        info!(
            account_id = %account.account_id,
            bucket,
            retention_days = self.retention.num_days(),
            "purging expired flow logs"
        );
        let Some(keys) = self.list_objects(bucket).await? else {
            info!(bucket, "bucket not created yet");
            return Ok(0);
        };

        let now = self.clock.now();
        let dir = self.bucket_dir(bucket)?;
        let mut deleted = 0;
        for key in keys.iter().filter(|key| is_expired(key, now, self.retention)) {
            match fs::remove_file(dir.join(key)).await {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(FlowlogError::Archive(format!(
                        "Failed to delete '{}/{}': {}",
                        bucket, key, err
                    )));
                }
            }
        }
        info!(account_id = %account.account_id, bucket, deleted, "purged flow logs");
        Ok(deleted)
    }
}
