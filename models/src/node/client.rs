use super::error::{self, Result};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PropagationPolicy};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

#[async_trait]
/// A trait providing an interface to the cluster state the drain pipeline reads and mutates.
/// This is provided as a trait in order to allow mocks to be used for testing purposes.
pub trait NodeClient: Clone + Sized + Send + Sync {
    /// Returns the full node inventory of the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    /// Fetches a single node by name. Used to take a fresh look at schedulability
    /// and the provider identity right before acting on it.
    async fn get_node(&self, node_name: &str) -> Result<Node>;
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    /// Lists pods bound to the given node, excluding pods already in a terminal phase.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    /// Deletes a pod with the given grace period, orphaning its dependents.
    /// Deleting a pod which is already gone is a success, not an error.
    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: u32,
    ) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock NodeClient for use in tests.
    pub NodeClient {}
    #[async_trait]
    impl NodeClient for NodeClient {
        async fn list_nodes(&self) -> Result<Vec<Node>>;
        async fn get_node(&self, node_name: &str) -> Result<Node>;
        async fn cordon_node(&self, node_name: &str) -> Result<()>;
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn delete_pod(
            &self,
            namespace: &str,
            pod_name: &str,
            grace_period_seconds: u32,
        ) -> Result<()>;
    }

    impl Clone for NodeClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> NodeClient for Arc<T>
where
    T: NodeClient,
{
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes().await
    }

    async fn get_node(&self, node_name: &str) -> Result<Node> {
        (**self).get_node(node_name).await
    }

    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        (**self).cordon_node(node_name).await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_pods_on_node(node_name).await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        (**self)
            .delete_pod(namespace, pod_name, grace_period_seconds)
            .await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `NodeClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8sNodeClient {
    k8s_client: kube::Client,
}

impl K8sNodeClient {
    pub fn new(k8s_client: kube::Client) -> Self {
        K8sNodeClient { k8s_client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }
}

#[async_trait]
impl NodeClient for K8sNodeClient {
    #[instrument(skip(self), err)]
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default())
            .await
            .context(error::ListNodesSnafu)?;
        Ok(nodes.items)
    }

    #[instrument(skip(self), err)]
    async fn get_node(&self, node_name: &str) -> Result<Node> {
        self.nodes().get(node_name).await.context(error::GetNodeSnafu {
            node_name: node_name.to_string(),
        })
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        self.nodes()
            .cordon(node_name)
            .await
            .context(error::CordonNodeSnafu {
                node_name: node_name.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let bound = pods
            .list(&ListParams {
                field_selector: Some(format!(
                    "spec.nodeName={},status.phase!=Succeeded,status.phase!=Failed",
                    node_name
                )),
                ..Default::default()
            })
            .await
            .context(error::ListPodsSnafu {
                node_name: node_name.to_string(),
            })?;
        Ok(bound.items)
    }

    #[instrument(skip(self), err)]
    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let delete_params = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds),
            // The drain must not cascade into dependent objects.
            propagation_policy: Some(PropagationPolicy::Orphan),
            ..Default::default()
        };

        match pods.delete(pod_name, &delete_params).await {
            Ok(_) => Ok(()),
            Err(e) if pod_already_gone(&e) => {
                event!(
                    Level::INFO,
                    "Pod '{}/{}' already deleted.",
                    namespace,
                    pod_name
                );
                Ok(())
            }
            Err(e) => Err(e).context(error::DeletePodSnafu {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
            }),
        }
    }
}

/// A deletion which races with the pod's own exit comes back as not-found; the pod being
/// gone is exactly the state the drain wanted. Only 404 qualifies.
fn pod_already_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} returned by the API server", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn not_found_on_delete_is_success() {
        assert!(pod_already_gone(&api_error(404, "NotFound")));
    }

    #[test]
    fn other_api_errors_still_fail_deletion() {
        assert!(!pod_already_gone(&api_error(409, "Conflict")));
        assert!(!pod_already_gone(&api_error(403, "Forbidden")));
        assert!(!pod_already_gone(&api_error(500, "InternalError")));
    }
}
