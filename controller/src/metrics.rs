//! Queries a Prometheus-compatible metrics store for node resource utilization.
//!
//! The threshold predicate is baked into the query expression, so every sample the
//! store returns is already a drain candidate from the metrics point of view; no
//! post-filtering by value happens downstream.

use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{event, instrument, Level};

/// Metric label holding the scrape target address in `ip:port` form.
const INSTANCE_LABEL: &str = "instance";
/// Metric label holding a bare node name, for exporters that attach one.
const NODE_LABEL: &str = "node";

/// The module-wide result type.
type Result<T> = std::result::Result<T, metrics_error::Error>;

/// A single node's utilization reading, as matched by the threshold query.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationSample {
    /// The identity the sample carries for its node: an address or a node name,
    /// depending on the configured [`IdentitySource`].
    pub node_identity: String,
    pub value: f64,
}

/// Where a sample's node identity is extracted from. Both forms occur in practice,
/// depending on which exporter produced the underlying metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySource {
    /// The `instance` label, truncated at the first colon to strip the port suffix.
    InstanceAddress,
    /// The `node` label, used verbatim.
    NodeLabel,
}

/// The resource whose utilization drives candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Disk,
    Memory,
}

impl ResourceKind {
    /// Renders the query expression with the threshold embedded.
    ///
    /// The disk form selects nodes *above* the threshold (overloaded filesystems).
    /// The memory form is inverted: it selects nodes *below* the threshold, which is
    /// used to consolidate under-utilized nodes out of the cluster.
    pub fn query_expression(&self, threshold_percentage: f64) -> String {
        match self {
            ResourceKind::Disk => format!(
                "(1 - node_filesystem_avail_bytes / node_filesystem_size_bytes) * 100 > {}",
                threshold_percentage
            ),
            ResourceKind::Memory => format!(
                "100 * (1 - (node_memory_MemFree_bytes + node_memory_Cached_bytes + node_memory_Buffers_bytes) / node_memory_MemTotal_bytes) < {}",
                threshold_percentage
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    warnings: Vec<String>,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: BTreeMap<String, String>,
    /// `[unix_timestamp, "stringified value"]`
    value: (f64, String),
}

/// A client for the Prometheus HTTP query API.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    address: String,
    org_id: Option<String>,
    identity_source: IdentitySource,
    http: reqwest::Client,
}

impl PrometheusSource {
    pub fn new(
        address: String,
        org_id: Option<String>,
        identity_source: IdentitySource,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context(metrics_error::BuildClientSnafu)?;
        Ok(PrometheusSource {
            address,
            org_id,
            identity_source,
            http,
        })
    }

    /// Issues an instant query and returns the matching samples.
    ///
    /// The timeout is a hard cancellation bound on the whole request. Warnings in the
    /// response are logged, not escalated. There is no retry here; retry policy belongs
    /// to the caller.
    #[instrument(skip(self), err)]
    pub async fn query(
        &self,
        expression: &str,
        timeout: Duration,
    ) -> Result<Vec<UtilizationSample>> {
        let url = format!("{}/api/v1/query", self.address.trim_end_matches('/'));
        let mut request = self
            .http
            .get(&url)
            .query(&[("query", expression)])
            .timeout(timeout);
        if let Some(org_id) = &self.org_id {
            request = request.header("X-Scope-OrgID", org_id);
        }

        let response: QueryResponse = request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .context(metrics_error::QuerySnafu)?
            .json()
            .await
            .context(metrics_error::QuerySnafu)?;

        for warning in &response.warnings {
            event!(Level::WARN, %warning, "Metrics store returned a query warning.");
        }
        ensure!(
            response.status == "success",
            metrics_error::QueryStatusSnafu {
                status: response.status,
            }
        );
        ensure!(
            response.data.result_type == "vector",
            metrics_error::UnexpectedResultTypeSnafu {
                result_type: response.data.result_type,
            }
        );

        let vector: Vec<VectorSample> = serde_json::from_value(response.data.result)
            .context(metrics_error::MalformedVectorSnafu)?;

        Ok(samples_from_vector(vector, self.identity_source))
    }
}

/// Converts raw vector samples into utilization samples, extracting node identities.
/// Samples without a usable identity label or value are dropped with a warning rather
/// than failing the whole query.
fn samples_from_vector(
    vector: Vec<VectorSample>,
    identity_source: IdentitySource,
) -> Vec<UtilizationSample> {
    vector
        .into_iter()
        .filter_map(|sample| {
            let node_identity = match extract_identity(&sample.metric, identity_source) {
                Some(identity) => identity,
                None => {
                    event!(
                        Level::WARN,
                        labels = ?sample.metric,
                        "Dropping sample without a node identity label."
                    );
                    return None;
                }
            };
            let value = match sample.value.1.parse::<f64>() {
                Ok(value) => value,
                Err(_) => {
                    event!(
                        Level::WARN,
                        value = %sample.value.1,
                        "Dropping sample with a non-numeric value."
                    );
                    return None;
                }
            };
            Some(UtilizationSample {
                node_identity,
                value,
            })
        })
        .collect()
}

fn extract_identity(
    labels: &BTreeMap<String, String>,
    identity_source: IdentitySource,
) -> Option<String> {
    match identity_source {
        IdentitySource::InstanceAddress => labels.get(INSTANCE_LABEL).map(|address| {
            // Scrape targets are registered as `ip:port`; everything past the first
            // colon is the exporter's port, not part of the node identity.
            address
                .split(':')
                .next()
                .unwrap_or(address.as_str())
                .to_string()
        }),
        IdentitySource::NodeLabel => labels.get(NODE_LABEL).cloned(),
    }
}

pub mod metrics_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to build metrics HTTP client: '{}'", source))]
        BuildClient { source: reqwest::Error },

        #[snafu(display("Metrics query failed: '{}'", source))]
        Query { source: reqwest::Error },

        #[snafu(display("Metrics store reported query status '{}'", status))]
        QueryStatus { status: String },

        #[snafu(display(
            "Unexpected result type '{}' from metrics store, expected 'vector'",
            result_type
        ))]
        UnexpectedResultType { result_type: String },

        #[snafu(display("Unable to decode query result vector: '{}'", source))]
        MalformedVector { source: serde_json::Error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_expression_embeds_threshold() {
        let expr = ResourceKind::Disk.query_expression(70.0);
        assert_eq!(
            expr,
            "(1 - node_filesystem_avail_bytes / node_filesystem_size_bytes) * 100 > 70"
        );
    }

    #[test]
    fn memory_expression_is_inverted() {
        let expr = ResourceKind::Memory.query_expression(30.0);
        assert!(expr.ends_with("< 30"));
        assert!(expr.contains("node_memory_MemTotal_bytes"));
    }

    #[test]
    fn response_parses_vector_samples() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {
                        "metric": {"instance": "10.0.3.17:9100", "job": "node-exporter"},
                        "value": [1712000000.123, "85.4"]
                    }
                ]
            }
        }"#;
        let response: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(response.data.result_type, "vector");

        let vector: Vec<VectorSample> = serde_json::from_value(response.data.result).unwrap();
        let samples = samples_from_vector(vector, IdentitySource::InstanceAddress);
        assert_eq!(
            samples,
            vec![UtilizationSample {
                node_identity: "10.0.3.17".to_string(),
                value: 85.4,
            }]
        );
    }

    #[test]
    fn node_label_identity_is_used_verbatim() {
        let vector = vec![VectorSample {
            metric: maplit::btreemap! {
                "node".to_string() => "ip-10-0-3-17.internal".to_string(),
            },
            value: (0.0, "91.0".to_string()),
        }];
        let samples = samples_from_vector(vector, IdentitySource::NodeLabel);
        assert_eq!(samples[0].node_identity, "ip-10-0-3-17.internal");
    }

    #[test]
    fn samples_without_identity_or_value_are_dropped() {
        let vector = vec![
            VectorSample {
                metric: maplit::btreemap! {
                    "job".to_string() => "node-exporter".to_string(),
                },
                value: (0.0, "85.0".to_string()),
            },
            VectorSample {
                metric: maplit::btreemap! {
                    "instance".to_string() => "10.0.3.18:9100".to_string(),
                },
                value: (0.0, "NaN-ish".to_string()),
            },
        ];
        assert!(samples_from_vector(vector, IdentitySource::InstanceAddress).is_empty());
    }

    #[test]
    fn address_without_port_is_kept_whole() {
        let vector = vec![VectorSample {
            metric: maplit::btreemap! {
                "instance".to_string() => "10.0.3.17".to_string(),
            },
            value: (0.0, "75.0".to_string()),
        }];
        let samples = samples_from_vector(vector, IdentitySource::InstanceAddress);
        assert_eq!(samples[0].node_identity, "10.0.3.17");
    }
}
