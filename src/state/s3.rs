//! S3-based state storage backend.
//!
//! State lives in one object per project environment and every save is a
//! single `PutObject` of the whole snapshot. The lock is a second object
//! written with S3 conditional writes: a fresh lock only if none exists
//! (`If-None-Match: *`), a takeover of an expired lock only if it is still the
//! one that was read (`If-Match: <etag>`). Two runs racing for the lock cannot
//! both win.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeployError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Error codes S3 returns when a conditional write loses.
const LOST_RACE_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// Object keys for one project environment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StateKeys {
    state: String,
    lock: String,
}

impl StateKeys {
    /// Places both objects under `prefix`, ignoring stray slashes.
    fn new(prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}/"))
            .unwrap_or_default();
        Self {
            state: format!("{prefix}state.json"),
            lock: format!("{prefix}state.lock"),
        }
    }
}

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteCondition {
    Always,
    /// The key must not exist.
    Absent,
    /// The object must still carry this entity tag.
    Matches(String),
}

/// An object body with its entity tag.
#[derive(Debug)]
struct StoredObject {
    body: String,
    e_tag: Option<String>,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    keys: StateKeys,
}

fn lost_race(code: Option<&str>) -> bool {
    code.is_some_and(|c| LOST_RACE_CODES.contains(&c))
}

fn decode_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        DeployError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

fn locked_by(lock: &LockInfo) -> DeployError {
    DeployError::State(StateError::LockedByOther {
        holder: lock.holder.clone(),
        since: lock.acquired_at.to_rfc3339(),
    })
}

/// Decides how to write a new lock over the one currently stored.
///
/// A live lock is refused; an expired one is replaced only if it has not
/// changed since it was read.
fn claim_condition(current: Option<(&LockInfo, Option<&str>)>) -> Result<WriteCondition> {
    match current {
        None => Ok(WriteCondition::Absent),
        Some((lock, _)) if !lock.is_expired() => Err(locked_by(lock)),
        Some((lock, Some(e_tag))) => {
            debug!("Lock {} held by {} has expired, taking over", lock.lock_id, lock.holder);
            Ok(WriteCondition::Matches(e_tag.to_string()))
        }
        Some((lock, None)) => Err(DeployError::State(StateError::LockFailed {
            message: format!("expired lock {} has no entity tag to replace it by", lock.lock_id),
        })),
    }
}

impl S3StateStore {
    /// Creates a store using the AWS configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            keys: StateKeys::new(prefix),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(DeployError::State(StateError::s3(format!(
                    "S3 get of {key} failed: {service_err}"
                ))));
            }
        };

        let e_tag = response.e_tag().map(String::from);
        let bytes = response.body.collect().await.map_err(|e| {
            DeployError::State(StateError::s3(format!("Failed to read {key}: {e}")))
        })?;
        let body = String::from_utf8(bytes.to_vec()).map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Invalid UTF-8 in {key}: {e}"),
            })
        })?;

        Ok(Some(StoredObject { body, e_tag }))
    }

    /// Writes an object. Returns `false` if the condition did not hold.
    async fn put_object(&self, key: &str, content: &str, condition: &WriteCondition) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        let request = match condition {
            WriteCondition::Always => request,
            WriteCondition::Absent => request.if_none_match("*"),
            WriteCondition::Matches(e_tag) => request.if_match(e_tag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if lost_race(e.code()) => Ok(false),
            Err(e) => Err(DeployError::State(StateError::s3(format!(
                "S3 put of {key} failed: {e}"
            )))),
        }
    }

    /// Reports whoever holds the lock after a lost conditional write.
    async fn lock_conflict(&self) -> Result<DeployError> {
        let current = self.get_object(&self.keys.lock).await?;
        Ok(match current {
            Some(object) => locked_by(&decode_lock(&object.body)?),
            None => DeployError::State(StateError::LockFailed {
                message: String::from("lock changed while it was being acquired"),
            }),
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        debug!("Loading state from {}", self.location());

        let Some(object) = self.get_object(&self.keys.state).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StateSnapshot = serde_json::from_str(&object.body).map_err(|e| {
            DeployError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;
        state.check_version()?;

        info!(
            "Loaded state serial {} for {}/{}",
            state.serial, state.project, state.environment
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        debug!("Saving state serial {} to {}", state.serial, self.location());

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            DeployError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;
        self.put_object(&self.keys.state, &content, &WriteCondition::Always)
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, run_id: Option<Uuid>) -> Result<LockInfo> {
        let current = match self.get_object(&self.keys.lock).await? {
            Some(object) => Some((decode_lock(&object.body)?, object.e_tag)),
            None => None,
        };
        let condition = claim_condition(
            current
                .as_ref()
                .map(|(lock, e_tag)| (lock, e_tag.as_deref())),
        )?;

        let lock_info = LockInfo::new(&holder_or_generated(holder)).for_run(run_id);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            DeployError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        if !self.put_object(&self.keys.lock, &content, &condition).await? {
            warn!("Another run took the state lock first");
            return Err(self.lock_conflict().await?);
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let Some(object) = self.get_object(&self.keys.lock).await? else {
            return Ok(());
        };
        let existing = decode_lock(&object.body)?;
        if existing.lock_id != lock_id {
            debug!(
                "Lock ID mismatch: expected {lock_id}, found {}",
                existing.lock_id
            );
            return Ok(());
        }

        let mut request = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&self.keys.lock);
        if let Some(e_tag) = object.e_tag {
            request = request.if_match(e_tag);
        }
        match request.send().await {
            Ok(_) => info!("Released state lock: {lock_id}"),
            Err(e) if lost_race(e.code()) => {
                debug!("Lock {lock_id} was replaced before it could be released");
            }
            Err(e) => {
                return Err(DeployError::State(StateError::s3(format!(
                    "S3 delete of {} failed: {e}",
                    self.keys.lock
                ))));
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.keys.lock).await? {
            Some(object) => decode_lock(&object.body).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.keys.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn expired(holder: &str) -> LockInfo {
        let mut lock = LockInfo::new(holder);
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        lock
    }

    #[test]
    fn test_keys_follow_prefix() {
        assert_eq!(StateKeys::new(None).state, "state.json");
        assert_eq!(StateKeys::new(Some("/")).lock, "state.lock");

        let keys = StateKeys::new(Some("/gpu-batch/dev/"));
        assert_eq!(keys.state, "gpu-batch/dev/state.json");
        assert_eq!(keys.lock, "gpu-batch/dev/state.lock");
    }

    #[test]
    fn test_fresh_lock_requires_absent_key() {
        assert_eq!(claim_condition(None).expect("claimable"), WriteCondition::Absent);
    }

    #[test]
    fn test_live_lock_is_refused() {
        let lock = LockInfo::new("ci-runner");
        let err = claim_condition(Some((&lock, Some("\"abc\"")))).expect_err("lock is live");
        assert!(matches!(
            err,
            DeployError::State(StateError::LockedByOther { ref holder, .. }) if holder == "ci-runner"
        ));
    }

    #[test]
    fn test_expired_lock_is_replaced_only_if_unchanged() {
        let lock = expired("crashed-run");
        assert_eq!(
            claim_condition(Some((&lock, Some("\"abc\"")))).expect("claimable"),
            WriteCondition::Matches("\"abc\"".to_string())
        );
        assert!(matches!(
            claim_condition(Some((&lock, None))),
            Err(DeployError::State(StateError::LockFailed { .. }))
        ));
    }

    #[test]
    fn test_lost_race_codes() {
        assert!(lost_race(Some("PreconditionFailed")));
        assert!(lost_race(Some("ConditionalRequestConflict")));
        assert!(!lost_race(Some("NoSuchKey")));
        assert!(!lost_race(None));
    }

    #[test]
    fn test_corrupted_lock_is_reported() {
        let err = decode_lock("{not json").expect_err("corrupted");
        assert!(err.is_state_corruption());

        let lock = LockInfo::new("ci-runner").for_run(Some(Uuid::new_v4()));
        let content = serde_json::to_string(&lock).expect("serialize");
        assert_eq!(decode_lock(&content).expect("decodes"), lock);
    }

    #[test]
    fn test_location_uses_state_key() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let store = S3StateStore::with_client(Client::from_conf(config), "tf-state", Some("gpu-batch/dev"));

        assert_eq!(store.location(), "s3://tf-state/gpu-batch/dev/state.json");
        assert_eq!(store.backend_type(), "s3");
    }
}
