//! In-memory stand-in for the cloud.
//!
//! [`SimulatedCloud`] keeps remote objects in memory, assigns deterministic
//! identifiers and outputs, and can inject latency and failures. It backs the
//! CLI when no real provider is available and drives the engine's tests.
//! Its object table can be saved to and loaded from a JSON file so that
//! consecutive CLI runs observe the same "remote" objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DeployError, ProviderError, Result, StateError};
use crate::model::{Properties, ResourceKind, schema_for};

use super::capability::{Outputs, Provider, ProviderResource};
use super::registry::ProviderRegistry;

/// A provider operation, used for failure injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOp {
    /// `create`.
    Create,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Operation.
    pub op: ProviderOp,
    /// Kind of the provider called.
    pub kind: ResourceKind,
    /// Logical name of the object.
    pub name: String,
}

/// A remote object held by the simulated cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedObject {
    /// Object kind.
    pub kind: ResourceKind,
    /// Logical name it was created under.
    pub name: String,
    /// Sequence number, unique per object.
    pub serial: u64,
    /// Last applied properties.
    pub properties: Properties,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudInner {
    next_serial: u64,
    objects: BTreeMap<String, SimulatedObject>,
    #[serde(skip)]
    failures: HashMap<(ProviderOp, String), u32>,
    #[serde(skip)]
    calls: Vec<CallRecord>,
    #[serde(skip)]
    in_flight: usize,
    #[serde(skip)]
    max_in_flight: usize,
}

/// Shared in-memory cloud.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCloud {
    inner: Arc<Mutex<CloudInner>>,
    latency: Duration,
    idempotent: bool,
}

/// Provider for one kind, backed by a [`SimulatedCloud`].
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    kind: ResourceKind,
    cloud: SimulatedCloud,
}

impl SimulatedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a cloud previously written with [`Self::save`].
    ///
    /// A missing file yields an empty cloud.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::new());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let inner: CloudInner = serde_json::from_str(&content).map_err(|e| {
            DeployError::State(StateError::corrupted(format!(
                "Failed to parse simulated cloud file: {e}"
            )))
        })?;

        info!("Loaded {} simulated objects", inner.objects.len());
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            ..Self::default()
        })
    }

    /// Writes the object table to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = {
            let inner = self.lock();
            serde_json::to_string_pretty(&*inner)
                .map_err(|e| DeployError::State(StateError::serialization(e.to_string())))?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Adds a delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Marks the providers as idempotent, which allows retries.
    #[must_use]
    pub const fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Makes the next `times` calls of `op` on the named object fail.
    pub fn fail(&self, op: ProviderOp, name: &str, times: u32) {
        self.lock().failures.insert((op, name.to_string()), times);
    }

    /// Makes every call of `op` on the named object fail.
    pub fn fail_always(&self, op: ProviderOp, name: &str) {
        self.fail(op, name, u32::MAX);
    }

    /// Returns a registry with a simulated provider for every kind.
    #[must_use]
    pub fn registry(&self) -> ProviderRegistry {
        ResourceKind::ALL
            .into_iter()
            .fold(ProviderRegistry::new(), |registry, kind| {
                registry.with(Arc::new(SimulatedProvider {
                    kind,
                    cloud: self.clone(),
                }))
            })
    }

    /// Calls made so far, in the order they started.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Remote objects keyed by provider id.
    #[must_use]
    pub fn objects(&self) -> BTreeMap<String, SimulatedObject> {
        self.lock().objects.clone()
    }

    /// Finds a remote object by logical name.
    #[must_use]
    pub fn object_named(&self, name: &str) -> Option<SimulatedObject> {
        self.lock().objects.values().find(|o| o.name == name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, CloudInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call start and consumes an injected failure, if any.
    fn begin(&self, op: ProviderOp, kind: ResourceKind, name: &str) -> Option<ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(CallRecord {
            op,
            kind,
            name: name.to_string(),
        });
        inner.in_flight += 1;
        inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);

        let key = (op, name.to_string());
        let remaining = inner.failures.get(&key).copied().unwrap_or(0);
        if remaining == 0 {
            return None;
        }
        if remaining != u32::MAX {
            inner.failures.insert(key, remaining - 1);
        }

        Some(ProviderError::operation(
            op_name(op),
            name,
            "injected failure",
        ))
    }

    fn end(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

const fn op_name(op: ProviderOp) -> &'static str {
    match op {
        ProviderOp::Create => "create",
        ProviderOp::Update => "update",
        ProviderOp::Delete => "delete",
    }
}

/// Builds the outputs a kind reports for an object.
fn outputs_for(kind: ResourceKind, provider_id: &str, object: &SimulatedObject) -> Outputs {
    let octet = object.serial % 250 + 1;
    let candidates = [
        ("id", provider_id.to_string()),
        ("name", object.name.clone()),
        (
            "self_link",
            format!("https://compute.googleapis.com/compute/v1/{provider_id}"),
        ),
        ("address", format!("203.0.113.{octet}")),
        ("internal_ip", format!("10.128.0.{octet}")),
    ];

    let schema = schema_for(kind);
    candidates
        .into_iter()
        .filter(|(key, _)| schema.has_output(key))
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

impl SimulatedProvider {
    /// Creates a provider for one kind.
    #[must_use]
    pub const fn new(kind: ResourceKind, cloud: SimulatedCloud) -> Self {
        Self { kind, cloud }
    }

    fn object_name(&self, provider_id: &str) -> String {
        self.cloud
            .lock()
            .objects
            .get(provider_id)
            .map_or_else(|| provider_id.to_string(), |o| o.name.clone())
    }

    async fn run<T>(
        &self,
        op: ProviderOp,
        name: &str,
        apply: impl FnOnce(&mut CloudInner) -> std::result::Result<T, ProviderError>,
    ) -> std::result::Result<T, ProviderError> {
        let injected = self.cloud.begin(op, self.kind, name);
        self.cloud.pause().await;

        let result = match injected {
            Some(err) => Err(err),
            None => apply(&mut *self.cloud.lock()),
        };

        self.cloud.end();
        result
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn is_idempotent(&self) -> bool {
        self.cloud.idempotent
    }

    async fn create(
        &self,
        name: &str,
        properties: &Properties,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        let kind = self.kind;
        let resource = self
            .run(ProviderOp::Create, name, |inner| {
                inner.next_serial += 1;
                let serial = inner.next_serial;
                let provider_id = format!("{kind}/{name}-{serial}");
                let object = SimulatedObject {
                    kind,
                    name: name.to_string(),
                    serial,
                    properties: properties.clone(),
                };
                let outputs = outputs_for(kind, &provider_id, &object);
                inner.objects.insert(provider_id.clone(), object);
                Ok(ProviderResource {
                    provider_id,
                    outputs,
                })
            })
            .await?;

        debug!("Simulated create of {kind} '{name}': {}", resource.provider_id);
        Ok(resource)
    }

    async fn update(
        &self,
        provider_id: &str,
        properties: &Properties,
    ) -> std::result::Result<Outputs, ProviderError> {
        let kind = self.kind;
        let name = self.object_name(provider_id);
        self.run(ProviderOp::Update, &name, |inner| {
            let object = inner
                .objects
                .get_mut(provider_id)
                .ok_or_else(|| ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                })?;
            object.properties = properties.clone();
            Ok(outputs_for(kind, provider_id, object))
        })
        .await
    }

    async fn delete(&self, provider_id: &str) -> std::result::Result<(), ProviderError> {
        let name = self.object_name(provider_id);
        self.run(ProviderOp::Delete, &name, |inner| {
            inner
                .objects
                .remove(provider_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(cloud: &SimulatedCloud, kind: ResourceKind) -> SimulatedProvider {
        SimulatedProvider::new(kind, cloud.clone())
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let cloud = SimulatedCloud::new();
        let addr = provider(&cloud, ResourceKind::Address);

        let created = addr
            .create("addr", &Properties::new())
            .await
            .expect("create");
        assert_eq!(created.provider_id, "address/addr-1");
        assert_eq!(created.outputs["address"], "203.0.113.2");
        assert!(!created.outputs.contains_key("internal_ip"));

        let outputs = addr
            .update(&created.provider_id, &Properties::new())
            .await
            .expect("update");
        assert_eq!(outputs, created.outputs);

        addr.delete(&created.provider_id).await.expect("delete");
        assert!(cloud.objects().is_empty());

        let again = addr.delete(&created.provider_id).await;
        assert!(matches!(again, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let cloud = SimulatedCloud::new();
        cloud.fail(ProviderOp::Create, "net", 1);
        let net = provider(&cloud, ResourceKind::Network);

        assert!(net.create("net", &Properties::new()).await.is_err());
        assert!(net.create("net", &Properties::new()).await.is_ok());
        assert_eq!(cloud.calls().len(), 2);
        assert!(cloud.object_named("net").is_some());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("cloud.json");

        let cloud = SimulatedCloud::new();
        provider(&cloud, ResourceKind::Disk)
            .create("disk", &Properties::new())
            .await
            .expect("create");
        cloud.save(&path).await.expect("save");

        let loaded = SimulatedCloud::load(&path).await.expect("load");
        assert_eq!(loaded.objects(), cloud.objects());

        let missing = SimulatedCloud::load(&dir.path().join("none.json"))
            .await
            .expect("load missing");
        assert!(missing.objects().is_empty());
    }
}
