//! SignalRecord status persistence
//!
//! Status writes are merge patches conditioned on `metadata.resourceVersion`.
//! A 409 triggers a refetch; if the refetched record already reached the
//! phase being written the write is dropped, otherwise it is retried.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use sigproc_common::crd::{SignalRecord, SignalRecordStatus};
use sigproc_common::{Error, CONTROLLER_NAME};

/// Attempts made before a conflicting status write gives up
pub const MAX_STATUS_ATTEMPTS: u32 = 5;

/// Status keys cleared explicitly when absent, so a merge patch replaces
/// the whole status instead of leaving stale fields behind
const STATUS_KEYS: &[&str] = &[
    "observedGeneration",
    "startTime",
    "completionTime",
    "kubernetesContext",
    "environmentClassification",
    "priorityAssignment",
    "businessClassification",
    "severity",
    "policyVersions",
    "conditions",
    "error",
];

/// Trait abstracting SignalRecord reads and status writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Get a SignalRecord, `None` if it was deleted
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SignalRecord>, Error>;

    /// Merge-patch the status, failing with 409 if `resource_version` is stale
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &SignalRecordStatus,
    ) -> Result<(), Error>;
}

/// [`SignalStore`] backed by the API server
pub struct KubeSignalStore {
    client: Client,
}

impl KubeSignalStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignalStore for KubeSignalStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SignalRecord>, Error> {
        let api: Api<SignalRecord> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &SignalRecordStatus,
    ) -> Result<(), Error> {
        let api: Api<SignalRecord> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(resource_version.as_deref(), status)?;
        api.patch_status(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Build the merge patch body for a status write
pub fn status_patch(resource_version: Option<&str>, status: &SignalRecordStatus) -> Result<Value, Error> {
    let mut body = match serde_json::to_value(status) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => return Err(Error::serialization(e.to_string())),
    };
    for key in STATUS_KEYS {
        body.entry(key.to_string()).or_insert(Value::Null);
    }

    let mut patch = json!({ "status": body });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// Result of a status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The status was persisted
    Written,
    /// The stored record had already progressed; nothing was written
    Superseded,
}

/// Persist `status` on `record` with optimistic concurrency
///
/// Gives up with [`Error::Conflict`] after [`MAX_STATUS_ATTEMPTS`].
pub async fn write_status(
    store: &dyn SignalStore,
    record: &SignalRecord,
    status: &SignalRecordStatus,
) -> Result<WriteOutcome, Error> {
    let name = record.name_any();
    let namespace = record.namespace().unwrap_or_default();
    let mut resource_version = record.resource_version();

    for attempt in 1..=MAX_STATUS_ATTEMPTS {
        match store
            .patch_status(&namespace, &name, resource_version.clone(), status)
            .await
        {
            Ok(()) => {
                debug!(signal = %name, phase = %status.phase, attempt, "status written");
                return Ok(WriteOutcome::Written);
            }
            Err(e) if e.is_conflict() => {
                warn!(signal = %name, attempt, "status write conflicted, refetching");
                let latest = store
                    .get(&namespace, &name)
                    .await?
                    .ok_or_else(|| Error::not_found("SignalRecord", format!("{namespace}/{name}")))?;
                if is_superseded(latest.status.as_ref(), status) {
                    debug!(signal = %name, phase = %status.phase, "stored status already advanced, dropping write");
                    return Ok(WriteOutcome::Superseded);
                }
                resource_version = latest.resource_version();
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::conflict(name, MAX_STATUS_ATTEMPTS))
}

/// Whether `stored` already reflects the transition `ours` would make
fn is_superseded(stored: Option<&SignalRecordStatus>, ours: &SignalRecordStatus) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    match (stored.observed_generation, ours.observed_generation) {
        (Some(s), Some(o)) if s > o => true,
        (Some(s), Some(o)) if s < o => false,
        _ => stored.phase.rank() >= ours.phase.rank(),
    }
}
