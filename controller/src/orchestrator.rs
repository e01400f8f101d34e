//! Drives each drain candidate through the cordon, evict, wait, terminate state machine.
//!
//! Candidates are processed strictly one at a time. Combined with the selector's
//! one-candidate-per-node guarantee, this means a node is never operated on by more
//! than one concurrent drain instance. One node's failure never aborts its siblings;
//! the public result is always a per-node outcome list.

use crate::selector::DrainCandidate;
use crate::terminator::{self, InstanceTerminator};
use models::node::{EvictionDecision, EvictionPolicy, NodeClient, NodeClientError};

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

// Transient API errors during cordon (conflicts, throttling) are retried briefly with
// backoff before the node is marked failed.
const CORDON_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const CORDON_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
const CORDON_RETRIES: usize = 3;

/// Per-node position in the drain state machine. Transitions are strictly forward,
/// except `Failed`, which is terminal from any state. Never persisted: a restarted run
/// begins again from `Selected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DrainState {
    Selected,
    Cordoned,
    Evicting,
    Drained,
    Terminating,
    Terminated,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The node could not be fetched or marked unschedulable.
    Cordon,
    /// Evictable pods remained when the per-node deadline elapsed. The node is left
    /// cordoned for an operator to investigate (e.g. a disruption budget blocking
    /// deletion); it is never terminated in this state.
    EvictionTimeout,
    /// The node's provider identity was missing or did not contain an instance id.
    InstanceIdentity,
    /// The cloud provider rejected the termination request. The node remains drained.
    Termination,
}

/// The per-node result row reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub node_name: String,
    pub final_state: DrainState,
    pub error: Option<String>,
}

/// Timing knobs for a drain run.
#[derive(Debug, Clone)]
pub struct DrainTunables {
    /// Overall deadline for emptying one node.
    pub drain_timeout: Duration,
    /// Sleep between pod-listing polls.
    pub poll_interval: Duration,
    /// Grace period for ordinary pod deletions, in seconds.
    pub pod_grace_period_seconds: u32,
    /// Fixed delay between successive pod deletions, to avoid hammering the API server.
    pub delete_throttle: Duration,
}

struct StepFailure {
    reason: FailureReason,
    message: String,
}

impl StepFailure {
    fn new(reason: FailureReason, error: impl std::fmt::Display) -> Self {
        StepFailure {
            reason,
            message: error.to_string(),
        }
    }

    fn into_outcome(self, node_name: &str) -> NodeOutcome {
        NodeOutcome {
            node_name: node_name.to_string(),
            final_state: DrainState::Failed(self.reason),
            error: Some(self.message),
        }
    }
}

/// Executes the drain state machine for a set of candidates.
pub struct DrainOrchestrator<C, T> {
    client: C,
    terminator: T,
    policy: EvictionPolicy,
    tunables: DrainTunables,
}

impl<C, T> DrainOrchestrator<C, T>
where
    C: NodeClient,
    T: InstanceTerminator,
{
    pub fn new(client: C, terminator: T, policy: EvictionPolicy, tunables: DrainTunables) -> Self {
        DrainOrchestrator {
            client,
            terminator,
            policy,
            tunables,
        }
    }

    /// Drains every candidate to a terminal state and reports one outcome per node.
    pub async fn run(&self, candidates: &[DrainCandidate]) -> Vec<NodeOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let outcome = self.drain_candidate(candidate).await;
            match &outcome.final_state {
                DrainState::Terminated => {
                    event!(Level::INFO, node_name = %outcome.node_name, "Node drained and terminated.")
                }
                state => {
                    event!(
                        Level::WARN,
                        node_name = %outcome.node_name,
                        final_state = ?state,
                        error = ?outcome.error,
                        "Node did not complete the drain."
                    )
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    #[instrument(skip(self, candidate), fields(node_name = %candidate.node_name))]
    async fn drain_candidate(&self, candidate: &DrainCandidate) -> NodeOutcome {
        let node_name = candidate.node_name.as_str();
        let mut state = DrainState::Selected;
        event!(Level::DEBUG, ?state, "Starting drain.");

        if let Err(failure) = self.cordon_if_needed(node_name).await {
            return failure.into_outcome(node_name);
        }
        state = DrainState::Cordoned;
        event!(Level::DEBUG, ?state, "State transition.");

        state = DrainState::Evicting;
        event!(Level::DEBUG, ?state, "State transition.");
        if let Err(failure) = self.evict_and_wait(node_name).await {
            return failure.into_outcome(node_name);
        }
        state = DrainState::Drained;
        event!(Level::DEBUG, ?state, "State transition.");

        state = DrainState::Terminating;
        event!(Level::DEBUG, ?state, "State transition.");
        if let Err(failure) = self.terminate_backing_instance(node_name).await {
            return failure.into_outcome(node_name);
        }

        NodeOutcome {
            node_name: node_name.to_string(),
            final_state: DrainState::Terminated,
            error: None,
        }
    }

    /// Marks the node unschedulable. A node which was cordoned previously (by this
    /// controller or anyone else) short-circuits without an update call; it still goes
    /// through eviction and wait.
    async fn cordon_if_needed(&self, node_name: &str) -> Result<(), StepFailure> {
        let node = self
            .client
            .get_node(node_name)
            .await
            .map_err(|err| StepFailure::new(FailureReason::Cordon, err))?;

        let already_unschedulable = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        if already_unschedulable {
            event!(
                Level::INFO,
                node_name,
                "Node is already unschedulable; skipping cordon update."
            );
            return Ok(());
        }

        let retry_strategy = ExponentialBackoff::from_millis(
            CORDON_RETRY_BASE_DELAY.as_millis() as u64,
        )
        .max_delay(CORDON_RETRY_MAX_DELAY)
        .map(jitter)
        .take(CORDON_RETRIES);

        event!(Level::INFO, node_name, "Cordoning node.");
        RetryIf::spawn(
            retry_strategy,
            || self.client.cordon_node(node_name),
            transient_cordon_error,
        )
        .await
        .map_err(|err| StepFailure::new(FailureReason::Cordon, err))
    }

    /// Deletes evictable pods and waits until a fresh listing shows none remain.
    ///
    /// The aggregate effect of deletions is only ever trusted from a re-listing, never
    /// from the delete calls' return values. Listing failures inside the loop are
    /// retried on the next poll; only the deadline is terminal.
    async fn evict_and_wait(&self, node_name: &str) -> Result<(), StepFailure> {
        let deadline = Instant::now() + self.tunables.drain_timeout;

        loop {
            match self.client.list_pods_on_node(node_name).await {
                Ok(pods) => {
                    let evictable = evictable_pods(&pods, &self.policy);
                    if evictable.is_empty() {
                        event!(
                            Level::INFO,
                            node_name,
                            "No evictable pods remain; node is drained."
                        );
                        return Ok(());
                    }

                    event!(
                        Level::INFO,
                        node_name,
                        remaining = evictable.len(),
                        "Deleting evictable pods."
                    );
                    for (pod, decision) in evictable {
                        self.delete_pod(node_name, pod, decision).await;
                        if !self.tunables.delete_throttle.is_zero() {
                            sleep(self.tunables.delete_throttle).await;
                        }
                    }
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        node_name,
                        error = %err,
                        "Unable to list pods; retrying on the next poll."
                    );
                }
            }

            if Instant::now() >= deadline {
                return Err(StepFailure {
                    reason: FailureReason::EvictionTimeout,
                    message: format!(
                        "evictable pods remained after {:.0}s",
                        self.tunables.drain_timeout.as_secs_f64()
                    ),
                });
            }
            sleep(self.tunables.poll_interval).await;
        }
    }

    async fn delete_pod(&self, node_name: &str, pod: &Pod, decision: EvictionDecision) {
        let pod_name = match pod.metadata.name.as_deref() {
            Some(name) => name,
            None => return,
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let grace_period_seconds = if decision.force_immediate {
            0
        } else {
            self.tunables.pod_grace_period_seconds
        };

        event!(
            Level::INFO,
            node_name,
            pod = %format!("{}/{}", namespace, pod_name),
            grace_period_seconds,
            "Deleting pod."
        );
        if let Err(err) = self
            .client
            .delete_pod(namespace, pod_name, grace_period_seconds)
            .await
        {
            // Not terminal: the pod remains in the next listing and is retried there,
            // within the node's deadline budget.
            event!(
                Level::WARN,
                node_name,
                pod_name,
                error = %err,
                "Pod deletion failed; will retry after the next listing."
            );
        }
    }

    /// Resolves the node's backing instance and requests its termination. Only reached
    /// once a fresh listing has shown zero evictable pods on the node.
    async fn terminate_backing_instance(&self, node_name: &str) -> Result<(), StepFailure> {
        let node = self
            .client
            .get_node(node_name)
            .await
            .map_err(|err| StepFailure::new(FailureReason::InstanceIdentity, err))?;

        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.clone())
            .ok_or_else(|| StepFailure {
                reason: FailureReason::InstanceIdentity,
                message: format!("node '{}' carries no provider id", node_name),
            })?;
        let instance_id = terminator::instance_id_from_provider_id(&provider_id)
            .map_err(|err| StepFailure::new(FailureReason::InstanceIdentity, err))?;

        event!(
            Level::INFO,
            node_name,
            %instance_id,
            "Node is empty; terminating backing instance."
        );
        self.terminator
            .terminate(&instance_id)
            .await
            .map_err(|err| StepFailure::new(FailureReason::Termination, err))
    }
}

/// Conflicts and API-server throttling clear on their own and are worth another attempt;
/// any other cordon rejection is reported immediately, without burning the backoff budget.
fn transient_cordon_error(err: &NodeClientError) -> bool {
    matches!(
        err,
        NodeClientError::CordonNode {
            source: kube::Error::Api(response),
            ..
        } if response.code == 409 || response.code == 429
    )
}

/// Partitions a listing into the pods this controller is allowed to delete, paired with
/// their grace-period decision. Protected pods never appear here, so they neither get
/// deleted nor hold up the drain.
fn evictable_pods<'a>(
    pods: &'a [Pod],
    policy: &EvictionPolicy,
) -> Vec<(&'a Pod, EvictionDecision)> {
    pods.iter()
        .filter_map(|pod| {
            let decision = policy.classify(pod);
            if decision.protected {
                None
            } else {
                Some((pod, decision))
            }
        })
        .collect()
}
