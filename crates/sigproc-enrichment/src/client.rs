//! Read-only Kubernetes access used during enrichment

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

use sigproc_common::Error;

/// Default deadline for a single API call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Kinds whose metadata [`ClusterReader::get_metadata`] can resolve
pub const METADATA_KINDS: &[&str] = &[
    "Pod",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "Service",
];

/// Trait abstracting the Kubernetes reads needed for enrichment
///
/// Lookups return `Ok(None)` when the object does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, Error>;

    /// Get a StatefulSet
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Get the metadata of any kind in [`METADATA_KINDS`]
    ///
    /// Used for owner-reference traversal.
    async fn get_metadata(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObjectMeta>, Error>;

    /// List PodDisruptionBudgets in a namespace
    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>, Error>;

    /// List HorizontalPodAutoscalers in a namespace
    async fn list_hpas(&self, namespace: &str) -> Result<Vec<HorizontalPodAutoscaler>, Error>;

    /// Whether the namespace has at least one NetworkPolicy
    async fn has_network_policies(&self, namespace: &str) -> Result<bool, Error>;
}

/// [`ClusterReader`] backed by the API server
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    /// Create a new reader wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.namespaced::<K>(namespace).get_opt(name).await?)
    }

    async fn meta_of<K>(&self, namespace: &str, name: &str) -> Result<Option<ObjectMeta>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self
            .get_opt::<K>(namespace, name)
            .await?
            .map(|obj| obj.meta().clone()))
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn get_metadata(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObjectMeta>, Error> {
        match kind {
            "Pod" => self.meta_of::<Pod>(namespace, name).await,
            "ReplicaSet" => self.meta_of::<ReplicaSet>(namespace, name).await,
            "Deployment" => self.meta_of::<Deployment>(namespace, name).await,
            "StatefulSet" => self.meta_of::<StatefulSet>(namespace, name).await,
            "DaemonSet" => self.meta_of::<DaemonSet>(namespace, name).await,
            "Job" => self.meta_of::<Job>(namespace, name).await,
            "CronJob" => self.meta_of::<CronJob>(namespace, name).await,
            "Service" => self.meta_of::<Service>(namespace, name).await,
            other => Err(Error::validation(format!(
                "metadata lookup is not supported for kind {other}"
            ))),
        }
    }

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>, Error> {
        let api: Api<PodDisruptionBudget> = self.namespaced(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_hpas(&self, namespace: &str) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
        let api: Api<HorizontalPodAutoscaler> = self.namespaced(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn has_network_policies(&self, namespace: &str) -> Result<bool, Error> {
        let api: Api<NetworkPolicy> = self.namespaced(namespace);
        let list = api.list_metadata(&ListParams::default().limit(1)).await?;
        Ok(!list.items.is_empty())
    }
}

/// Run an API call under a deadline, mapping expiry to [`Error::Timeout`]
pub async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, timeout)),
    }
}
