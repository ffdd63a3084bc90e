//! S3-based state backend.
//!
//! Snapshots live at `<prefix><scope>/<environment>/snapshot.json`. Locks are
//! separate objects created with a conditional put (`If-None-Match: *`), so
//! only one writer can create a lock; an expired lock is taken over with an
//! `If-Match` on its `ETag`, so only one of several racing takers succeeds.
//! Snapshot writes and lock releases carry an `If-Match` on the `ETag` read
//! just before, so a holder whose lock lapsed cannot overwrite a successor.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StateError, TerrastackError};

use super::backend::{check_version, stale, StateBackend};
use super::lock::{BackendKey, LockInfo, LockRetry, LockToken};
use super::types::Snapshot;

/// Snapshot object name.
const SNAPSHOT_KEY: &str = "snapshot.json";

/// Default lock namespace when no lock table is configured.
const DEFAULT_LOCK_NAMESPACE: &str = "locks";

/// Precondition of a conditional put or delete.
#[derive(Debug, PartialEq, Eq)]
enum PutCondition {
    /// Unconditional write.
    Always,
    /// Only if the object does not exist.
    Absent,
    /// Only if the object still has this `ETag`.
    Matches(String),
}

/// Condition for replacing an object read with `etag`.
fn replace_condition(etag: Option<String>) -> PutCondition {
    etag.map_or(PutCondition::Always, PutCondition::Matches)
}

/// S3-based state backend.
#[derive(Debug, Clone)]
pub struct S3StateBackend {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Prefix of lock objects.
    lock_namespace: String,
    /// Retry policy for contended locks.
    retry: LockRetry,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn s3_error(message: String) -> TerrastackError {
    StateError::backend("s3", message).into()
}

/// Returns true if the SDK error is a failed precondition or a conflicting write.
fn precondition_failed<E>(err: &SdkError<E, HttpResponse>) -> bool {
    matches!(err.raw_response().map(|r| r.status().as_u16()), Some(409 | 412))
}

impl S3StateBackend {
    /// Creates a new S3 state backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        lock_table: Option<&str>,
    ) -> Result<Self> {
        if bucket.is_empty() {
            return Err(s3_error("Bucket name is required".to_string()));
        }

        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, lock_table))
    }

    /// Creates a new S3 state backend with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, lock_table: Option<&str>) -> Self {
        let prefix = normalize_prefix(prefix);
        let lock_namespace = format!(
            "{prefix}{}",
            normalize_prefix(Some(lock_table.unwrap_or(DEFAULT_LOCK_NAMESPACE)))
        );

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
            lock_namespace,
            retry: LockRetry::none(),
        }
    }

    /// Sets the retry policy for contended locks.
    #[must_use]
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    fn snapshot_key(&self, key: &BackendKey) -> String {
        format!("{}{}/{}/{SNAPSHOT_KEY}", self.prefix, key.scope, key.environment)
    }

    fn lock_key(&self, key: &BackendKey) -> String {
        format!("{}{}/{}.lock", self.lock_namespace, key.scope, key.environment)
    }

    /// Gets an object and its `ETag` from S3.
    async fn get_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(s3_error(format!("S3 get error: {service_err}")))
                }
            }
        }
    }

    /// Puts an object to S3. Returns false if the precondition did not hold.
    async fn put_object(&self, key: &str, content: &str, condition: PutCondition) -> Result<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        request = match condition {
            PutCondition::Always => request,
            PutCondition::Absent => request.if_none_match("*"),
            PutCondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if precondition_failed(&e) => Ok(false),
            Err(e) => Err(s3_error(format!("S3 put error: {e}"))),
        }
    }

    /// Deletes an object from S3. Returns false if the precondition did not hold.
    async fn delete_object(&self, key: &str, condition: PutCondition) -> Result<bool> {
        let mut request = self.client.delete_object().bucket(&self.bucket).key(key);
        if let PutCondition::Matches(etag) = condition {
            request = request.if_match(etag);
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if precondition_failed(&e) => Ok(false),
            Err(e) => Err(s3_error(format!("S3 delete error: {e}"))),
        }
    }

    /// Reads the stored snapshot with the condition a replacing put must meet.
    async fn read_snapshot_for_write(&self, key: &BackendKey) -> Result<(Snapshot, PutCondition)> {
        let Some((json, etag)) = self.get_object(&self.snapshot_key(key)).await? else {
            return Ok((Snapshot::empty(), PutCondition::Absent));
        };
        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot: {e}")))?;
        Ok((snapshot, replace_condition(etag)))
    }

    async fn read_lock(&self, key: &BackendKey) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, etag)) = self.get_object(&self.lock_key(key)).await? else {
            return Ok(None);
        };
        let lock: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some((lock, etag)))
    }

    async fn held_lock(&self, key: &BackendKey, token: &LockToken) -> Result<(LockInfo, Option<String>)> {
        match self.read_lock(key).await? {
            Some((lock, etag)) if lock.is_held_by(token) => Ok((lock, etag)),
            _ => Err(stale(key, token)),
        }
    }
}

fn serialize_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock)
        .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")).into())
}

#[async_trait]
impl StateBackend for S3StateBackend {
    async fn try_acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        let lock_key = self.lock_key(key);
        let lock_info = LockInfo::new(holder, ttl);
        let content = serialize_lock(&lock_info)?;

        let existing = self.read_lock(key).await?;
        let condition = match &existing {
            Some((lock, _)) if !lock.is_expired() => {
                return Err(lock.contention(key).into());
            }
            Some((lock, etag)) => {
                debug!("Expired lock on {key} held by {}, taking over", lock.holder);
                replace_condition(etag.clone())
            }
            None => PutCondition::Absent,
        };

        if !self.put_object(&lock_key, &content, condition).await? {
            return match self.read_lock(key).await? {
                Some((winner, _)) => Err(winner.contention(key).into()),
                None => Err(StateError::LockFailed {
                    message: format!("Lock for {key} changed during acquisition"),
                }
                .into()),
            };
        }

        info!(
            "Acquired state lock on s3://{}/{lock_key}: {} (expires in {}s)",
            self.bucket, lock_info.token, lock_info.ttl_secs
        );
        Ok(lock_info.token_for(key))
    }

    async fn read_snapshot(&self, key: &BackendKey) -> Result<Snapshot> {
        let object_key = self.snapshot_key(key);
        debug!("Loading snapshot from s3://{}/{object_key}", self.bucket);

        let Some((json, _)) = self.get_object(&object_key).await? else {
            debug!("No snapshot found in S3");
            return Ok(Snapshot::empty());
        };

        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot: {e}")))?;
        info!("Loaded snapshot v{} for {key}", snapshot.version);
        Ok(snapshot)
    }

    async fn write_snapshot(&self, key: &BackendKey, token: &LockToken, snapshot: &Snapshot) -> Result<()> {
        self.held_lock(key, token).await?;
        let (stored, condition) = self.read_snapshot_for_write(key).await?;
        check_version(stored.version, snapshot.version)?;

        let object_key = self.snapshot_key(key);
        info!("Saving snapshot v{} to s3://{}/{object_key}", snapshot.version, self.bucket);

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;
        // Another session replaced the snapshot after the read above, so this
        // lock was lost in between.
        if !self.put_object(&object_key, &content, condition).await? {
            return Err(stale(key, token));
        }

        debug!("Snapshot saved successfully to S3");
        Ok(())
    }

    async fn release_lock(&self, key: &BackendKey, token: &LockToken) -> Result<()> {
        if let Some((existing, etag)) = self.read_lock(key).await? {
            if existing.token == token.token {
                if self.delete_object(&self.lock_key(key), replace_condition(etag)).await? {
                    info!("Released state lock on {key}: {}", token.token);
                } else {
                    debug!("Lock on {key} changed before release, leaving it in place");
                }
            } else {
                debug!("Lock token mismatch: expected {}, found {}", token.token, existing.token);
            }
        }
        Ok(())
    }

    async fn renew_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo> {
        let (mut lock, etag) = self.held_lock(key, token).await?;
        lock.refresh();

        if !self
            .put_object(&self.lock_key(key), &serialize_lock(&lock)?, replace_condition(etag))
            .await?
        {
            return Err(stale(key, token));
        }
        debug!("Renewed lock on {key} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn lock_info(&self, key: &BackendKey) -> Result<Option<LockInfo>> {
        Ok(self.read_lock(key).await?.map(|(lock, _)| lock))
    }

    async fn force_unlock(&self, key: &BackendKey) -> Result<bool> {
        if self.read_lock(key).await?.is_none() {
            return Ok(false);
        }
        self.delete_object(&self.lock_key(key), PutCondition::Always).await?;
        info!("Force-unlocked {key}");
        Ok(true)
    }

    fn lock_retry(&self) -> LockRetry {
        self.retry
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(prefix: Option<&str>, lock_table: Option<&str>) -> S3StateBackend {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3StateBackend::with_client(Client::from_conf(config), "state-bucket", prefix, lock_table)
    }

    #[test]
    fn test_object_layout() {
        let key = BackendKey::new("infra", "prod");

        let plain = backend(None, None);
        assert_eq!(plain.snapshot_key(&key), "infra/prod/snapshot.json");
        assert_eq!(plain.lock_key(&key), "locks/infra/prod.lock");

        let prefixed = backend(Some("/terrastack/"), Some("state-locks"));
        assert_eq!(prefixed.snapshot_key(&key), "terrastack/infra/prod/snapshot.json");
        assert_eq!(prefixed.lock_key(&key), "terrastack/state-locks/infra/prod.lock");
    }

    #[test]
    fn test_replace_condition_fences_on_etag() {
        assert_eq!(
            replace_condition(Some(String::from("\"v5\""))),
            PutCondition::Matches(String::from("\"v5\""))
        );
        assert_eq!(replace_condition(None), PutCondition::Always);
    }

    #[tokio::test]
    async fn test_empty_bucket_rejected() {
        let result = S3StateBackend::new("", None, Some("us-east-1"), None).await;
        assert!(result.is_err());
    }
}
