//! Well-known Kubernetes label and annotation keys consumed by the drain pipeline.

/// Annotation carrying the address the kubelet registered with. Metrics samples are joined
/// against this value, which may hold a bare IP or a compound value.
pub const PROVIDED_NODE_IP_ANNOTATION: &str = "alpha.kubernetes.io/provided-node-ip";

/// Label identifying the node pool a node was provisioned into (karpenter 0.32+).
pub const NODE_POOL_LABEL: &str = "karpenter.sh/nodepool";

/// Label identifying the instance type backing a node. Reported in dry-run output.
pub const INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";

/// Annotation marking a pod as system-critical. Such pods are never evicted here.
pub const CRITICAL_POD_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/critical-pod";

/// Namespace protected from eviction unless explicitly overridden.
pub const DEFAULT_CRITICAL_NAMESPACE: &str = "kube-system";

// Owner-reference kinds which imply a pod should not be deleted by generic drain logic.
pub const DAEMONSET_KIND: &str = "DaemonSet";
pub const STATEFULSET_KIND: &str = "StatefulSet";
