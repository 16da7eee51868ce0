//! Owner-reference traversal from a target up to its root controller

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use sigproc_common::crd::{OwnerChainEntry, TargetResource};
use sigproc_common::MAX_OWNER_CHAIN_DEPTH;
use tracing::{debug, warn};

use crate::client::{bounded, ClusterReader, DEFAULT_CALL_TIMEOUT, METADATA_KINDS};

/// Owner kinds the walk continues through; any other owner ends the chain
pub const TRAVERSABLE_OWNER_KINDS: &[&str] = &[
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
];

/// Builds the owner chain of a target, immediate owner first
pub struct OwnerChainBuilder {
    reader: Arc<dyn ClusterReader>,
    call_timeout: Duration,
    max_depth: usize,
}

impl OwnerChainBuilder {
    /// Create a builder with the default depth and call timeout
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self {
            reader,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_depth: MAX_OWNER_CHAIN_DEPTH,
        }
    }

    /// Override the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Walk controller owner references from `target`
    ///
    /// Stops at the root, after [`MAX_OWNER_CHAIN_DEPTH`] entries, on a
    /// repeated UID, on an owner kind outside [`TRAVERSABLE_OWNER_KINDS`], or
    /// when a lookup fails. Never errors; the chain gathered so far is
    /// returned.
    pub async fn build(&self, target: &TargetResource) -> Vec<OwnerChainEntry> {
        let Some(namespace) = target.namespace.as_deref() else {
            return Vec::new();
        };
        if !METADATA_KINDS.contains(&target.kind.as_str()) {
            return Vec::new();
        }

        let Some(meta) = self.lookup(&target.kind, namespace, &target.name).await else {
            return Vec::new();
        };
        self.walk(namespace, meta).await
    }

    /// Walk from already-fetched metadata of the target
    pub async fn walk(&self, namespace: &str, mut meta: ObjectMeta) -> Vec<OwnerChainEntry> {
        let mut chain = Vec::new();
        let mut visited: HashSet<String> = meta.uid.iter().cloned().collect();

        while chain.len() < self.max_depth {
            let Some(owner) = controller_owner(&meta).cloned() else {
                break;
            };
            if !visited.insert(owner.uid.clone()) {
                warn!(
                    kind = %owner.kind,
                    name = %owner.name,
                    uid = %owner.uid,
                    "owner reference cycle detected, stopping traversal"
                );
                break;
            }

            chain.push(OwnerChainEntry {
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
            });

            if chain.len() >= self.max_depth || !TRAVERSABLE_OWNER_KINDS.contains(&owner.kind.as_str()) {
                break;
            }
            match self.lookup(&owner.kind, namespace, &owner.name).await {
                Some(next) => meta = next,
                None => break,
            }
        }

        debug!(namespace, depth = chain.len(), "built owner chain");
        chain
    }

    async fn lookup(&self, kind: &str, namespace: &str, name: &str) -> Option<ObjectMeta> {
        let call = self.reader.get_metadata(kind, namespace, name);
        match bounded(self.call_timeout, "get owner metadata", call).await {
            Ok(Some(meta)) => Some(meta),
            Ok(None) => {
                debug!(kind, namespace, name, "owner not found, returning partial chain");
                None
            }
            Err(e) => {
                warn!(kind, namespace, name, error = %e, "owner lookup failed, returning partial chain");
                None
            }
        }
    }
}

/// The managing controller reference, else the first owner reference
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    let refs = meta.owner_references.as_deref()?;
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}
