//! Selects overloaded cluster nodes from time-series utilization metrics, drains them
//! safely, and terminates their backing compute instances.

pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod selector;
pub mod terminator;

pub use config::Config;
pub use orchestrator::{DrainOrchestrator, DrainState, FailureReason, NodeOutcome};

use metrics::PrometheusSource;
use models::node::NodeClient;
use selector::{select_candidates, DrainCandidate};
use terminator::InstanceTerminator;

use serde::Serialize;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, run_error::Error>;

/// The caller-facing result of one drain run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    /// The candidate set the metrics query and selector produced.
    pub candidates: Vec<DrainCandidate>,
    /// Per-node terminal results. Empty for a dry run.
    pub outcomes: Vec<NodeOutcome>,
}

/// Executes one drain run end to end: query the metrics store, join the result against
/// the node inventory, then drive every candidate through the drain state machine.
///
/// Selection failures (metrics query, node listing) abort before any node is mutated;
/// no partial candidate set is ever acted upon from an untrustworthy query result.
/// Per-node failures are reported in the outcome list, never escalated to a run error.
#[instrument(skip(node_client, metrics_source, terminator, config), err)]
pub async fn run_drain<C, T>(
    node_client: C,
    metrics_source: &PrometheusSource,
    terminator: T,
    config: &Config,
    threshold_override: Option<f64>,
    dry_run: bool,
) -> Result<RunReport>
where
    C: NodeClient,
    T: InstanceTerminator,
{
    let threshold = threshold_override.unwrap_or(config.threshold_percentage);
    let expression = config.resource.query_expression(threshold);

    let samples = metrics_source
        .query(&expression, config.query_timeout)
        .await
        .context(run_error::MetricsQuerySnafu)?;
    if samples.is_empty() {
        event!(Level::INFO, "No nodes matched the utilization query.");
        return Ok(RunReport {
            dry_run,
            candidates: Vec::new(),
            outcomes: Vec::new(),
        });
    }

    let nodes = node_client
        .list_nodes()
        .await
        .context(run_error::NodeInventorySnafu)?;
    let candidates = select_candidates(&samples, &nodes, &config.selector_settings(), dry_run);

    if dry_run {
        event!(
            Level::INFO,
            count = candidates.len(),
            "Dry run; reporting candidates without advancing any state machine."
        );
        return Ok(RunReport {
            dry_run,
            candidates,
            outcomes: Vec::new(),
        });
    }

    let orchestrator = DrainOrchestrator::new(
        node_client,
        terminator,
        config.eviction_policy(),
        config.drain_tunables(),
    );
    let outcomes = orchestrator.run(&candidates).await;

    Ok(RunReport {
        dry_run,
        candidates,
        outcomes,
    })
}

pub mod run_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Metrics query failed; aborting before any node is modified: '{}'",
            source
        ))]
        MetricsQuery {
            source: crate::metrics::metrics_error::Error,
        },

        #[snafu(display("Unable to list cluster nodes; aborting: '{}'", source))]
        NodeInventory {
            source: models::node::error::Error,
        },
    }
}
