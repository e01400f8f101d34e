//! Joins metrics samples against the live node inventory to produce drain candidates.
//!
//! This is a pure function of its inputs; all cluster reads happen before it and all
//! mutation happens after it.

use crate::metrics::UtilizationSample;
use models::constants;

use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{event, Level};

/// How a sample's node identity is compared against a node's recorded address.
///
/// The address annotation may carry a full IP or a compound value, so the default is a
/// deliberately loose substring containment. Exact matching is available for clusters
/// where the annotation holds exactly the sample identity; the orchestrator never sees
/// which strategy is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Substring,
    Exact,
}

impl MatchStrategy {
    fn matches(&self, node_address: &str, sample_identity: &str) -> bool {
        match self {
            MatchStrategy::Substring => node_address.contains(sample_identity),
            MatchStrategy::Exact => node_address == sample_identity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    /// Label key carrying the node pool name.
    pub pool_label_key: String,
    /// Only nodes whose pool label matches one of these (after trimming) are eligible.
    /// This is an intentional blast-radius control: a node over threshold but outside
    /// the allow-list is skipped.
    pub allowed_pools: Vec<String>,
    pub match_strategy: MatchStrategy,
}

/// A node picked for draining in the current run. Owned by the run; discarded after it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DrainCandidate {
    pub node_name: String,
    /// The pool label value that admitted this node.
    pub pool: String,
    /// Instance type, if labeled. Carried for operator-facing reports only.
    pub instance_type: Option<String>,
    pub utilization: f64,
}

/// Joins samples to nodes under the pool allow-list.
///
/// At most one candidate is produced per node, even if several samples match it. For a
/// real drain the result is ordered ascending by utilization, so the least-loaded nodes
/// are disrupted first; a dry-run report keeps inventory order.
pub fn select_candidates(
    samples: &[UtilizationSample],
    nodes: &[Node],
    settings: &SelectorSettings,
    dry_run: bool,
) -> Vec<DrainCandidate> {
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();

    for node in nodes {
        let node_name = match node.metadata.name.as_deref() {
            Some(name) => name,
            None => continue,
        };
        let address = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(constants::PROVIDED_NODE_IP_ANNOTATION));
        let address = match address {
            Some(address) => address,
            None => continue,
        };
        let pool = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&settings.pool_label_key))
            .map(|pool| pool.trim());
        let pool = match pool {
            Some(pool) if pool_allowed(pool, &settings.allowed_pools) => pool,
            _ => continue,
        };

        for sample in samples {
            if !settings
                .match_strategy
                .matches(address, &sample.node_identity)
            {
                continue;
            }
            if !seen.insert(node_name.to_string()) {
                break;
            }
            event!(
                Level::INFO,
                node_name,
                pool,
                utilization = sample.value,
                "Node selected as drain candidate."
            );
            candidates.push(DrainCandidate {
                node_name: node_name.to_string(),
                pool: pool.to_string(),
                instance_type: node
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(constants::INSTANCE_TYPE_LABEL))
                    .cloned(),
                utilization: sample.value,
            });
            break;
        }
    }

    if !dry_run {
        candidates.sort_by(|a, b| {
            a.utilization
                .partial_cmp(&b.utilization)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    candidates
}

fn pool_allowed(pool: &str, allowed_pools: &[String]) -> bool {
    allowed_pools.iter().any(|allowed| allowed.trim() == pool)
}
