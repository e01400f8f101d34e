//! Pure classification of pods into protected and evictable sets.
//!
//! The drain logic must never delete pods which are owned by workload controllers that
//! ignore cordons (DaemonSets), pods which carry cluster-critical workloads, or pods in
//! namespaces designated as critical. Classification happens at every poll from a fresh
//! pod listing; decisions are never cached because pod state can change between polls.

use crate::constants;
use k8s_openapi::api::core::v1::Pod;

/// The outcome of classifying a single pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionDecision {
    /// Protected pods are never deleted by the drain pipeline.
    pub protected: bool,
    /// A pod which cannot be rescheduled anyway is deleted without a grace period,
    /// since a graceful shutdown window only risks the drain timing out.
    pub force_immediate: bool,
}

/// Configuration for pod protection rules.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// When set, pods owned by a StatefulSet are protected in addition to DaemonSet pods.
    pub protect_statefulset: bool,
    /// Namespaces whose pods are never evicted.
    pub critical_namespaces: Vec<String>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy {
            protect_statefulset: true,
            critical_namespaces: vec![constants::DEFAULT_CRITICAL_NAMESPACE.to_string()],
        }
    }
}

impl EvictionPolicy {
    /// Classifies a pod. Performs no API calls; operates only on the given object.
    pub fn classify(&self, pod: &Pod) -> EvictionDecision {
        EvictionDecision {
            protected: self.is_protected(pod),
            force_immediate: is_unschedulable(pod),
        }
    }

    fn is_protected(&self, pod: &Pod) -> bool {
        if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
            let protected_owner = owner_references.iter().any(|reference| {
                reference.kind == constants::DAEMONSET_KIND
                    || (self.protect_statefulset && reference.kind == constants::STATEFULSET_KIND)
            });
            if protected_owner {
                return true;
            }
        }

        if let Some(namespace) = pod.metadata.namespace.as_ref() {
            if self.critical_namespaces.iter().any(|ns| ns == namespace) {
                return true;
            }
        }

        if let Some(annotations) = pod.metadata.annotations.as_ref() {
            if annotations.contains_key(constants::CRITICAL_POD_ANNOTATION) {
                return true;
            }
        }

        false
    }
}

/// A pod whose `PodScheduled` condition reports `Unschedulable` cannot be rescheduled
/// elsewhere; its deletion skips the grace period.
fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|cond| {
                cond.type_ == "PodScheduled"
                    && cond.status == "False"
                    && cond.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodCondition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use maplit::btreemap;

    fn pod_in_namespace(namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod_owned_by(kind: &str) -> Pod {
        let mut pod = pod_in_namespace("default");
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "1234".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn plain_pod_is_evictable() {
        let decision = EvictionPolicy::default().classify(&pod_in_namespace("default"));
        assert_eq!(
            decision,
            EvictionDecision {
                protected: false,
                force_immediate: false
            }
        );
    }

    #[test]
    fn daemonset_pod_is_protected() {
        assert!(
            EvictionPolicy::default()
                .classify(&pod_owned_by("DaemonSet"))
                .protected
        );
    }

    #[test]
    fn statefulset_protection_follows_policy() {
        let pod = pod_owned_by("StatefulSet");
        assert!(EvictionPolicy::default().classify(&pod).protected);

        let lenient = EvictionPolicy {
            protect_statefulset: false,
            ..Default::default()
        };
        assert!(!lenient.classify(&pod).protected);
    }

    #[test]
    fn replicaset_pod_is_evictable() {
        assert!(
            !EvictionPolicy::default()
                .classify(&pod_owned_by("ReplicaSet"))
                .protected
        );
    }

    #[test]
    fn critical_namespace_pod_is_protected() {
        assert!(
            EvictionPolicy::default()
                .classify(&pod_in_namespace("kube-system"))
                .protected
        );

        let custom = EvictionPolicy {
            critical_namespaces: vec!["kube-system".to_string(), "observability".to_string()],
            ..Default::default()
        };
        assert!(custom.classify(&pod_in_namespace("observability")).protected);
    }

    #[test]
    fn critical_annotation_pod_is_protected() {
        let mut pod = pod_in_namespace("default");
        pod.metadata.annotations = Some(btreemap! {
            constants::CRITICAL_POD_ANNOTATION.to_string() => "".to_string(),
        });
        assert!(EvictionPolicy::default().classify(&pod).protected);
    }

    #[test]
    fn unschedulable_pod_forces_immediate_deletion() {
        let mut pod = pod_in_namespace("default");
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_string(),
                status: "False".to_string(),
                reason: Some("Unschedulable".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let decision = EvictionPolicy::default().classify(&pod);
        assert!(!decision.protected);
        assert!(decision.force_immediate);
    }

    #[test]
    fn scheduled_pod_keeps_grace_period() {
        let mut pod = pod_in_namespace("default");
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!EvictionPolicy::default().classify(&pod).force_immediate);
    }
}
