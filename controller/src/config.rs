//! Environment-derived configuration for the drain controller.
//!
//! All tunables are read exactly once at startup into a [`Config`] value which is then
//! passed into the components that need it. No component reads the environment directly.

use crate::metrics::{IdentitySource, ResourceKind};
use crate::orchestrator::DrainTunables;
use crate::selector::{MatchStrategy, SelectorSettings};
use models::constants;
use models::node::EvictionPolicy;

use snafu::OptionExt;
use std::env;
use std::time::Duration;

const PROMETHEUS_ADDRESS_ENV_VAR: &str = "PROMETHEUS_ADDRESS";
const PROMETHEUS_SCOPE_ORG_ID_ENV_VAR: &str = "PROMETHEUS_SCOPE_ORG_ID";
const DRAIN_RESOURCE_ENV_VAR: &str = "DRAIN_RESOURCE";
const DRAIN_THRESHOLD_PERCENTAGE_ENV_VAR: &str = "DRAIN_THRESHOLD_PERCENTAGE";
const DRAIN_NODE_POOLS_ENV_VAR: &str = "DRAIN_NODE_POOLS";
const NODE_POOL_LABEL_KEY_ENV_VAR: &str = "NODE_POOL_LABEL_KEY";
const NODE_IDENTITY_SOURCE_ENV_VAR: &str = "NODE_IDENTITY_SOURCE";
const NODE_MATCH_STRATEGY_ENV_VAR: &str = "NODE_MATCH_STRATEGY";
const CRITICAL_NAMESPACES_ENV_VAR: &str = "CRITICAL_NAMESPACES";
const PROTECT_STATEFULSET_PODS_ENV_VAR: &str = "PROTECT_STATEFULSET_PODS";
const DRAIN_TIMEOUT_SECONDS_ENV_VAR: &str = "DRAIN_TIMEOUT_SECONDS";
const POLL_INTERVAL_SECONDS_ENV_VAR: &str = "POLL_INTERVAL_SECONDS";
const POD_GRACE_PERIOD_SECONDS_ENV_VAR: &str = "POD_GRACE_PERIOD_SECONDS";
const DELETE_THROTTLE_MILLIS_ENV_VAR: &str = "DELETE_THROTTLE_MILLIS";
const METRICS_QUERY_TIMEOUT_SECONDS_ENV_VAR: &str = "METRICS_QUERY_TIMEOUT_SECONDS";

const DEFAULT_THRESHOLD_PERCENTAGE: f64 = 70.0;
const DEFAULT_DRAIN_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const DEFAULT_POD_GRACE_PERIOD_SECONDS: u32 = 60;
const DEFAULT_DELETE_THROTTLE_MILLIS: u64 = 500;
const DEFAULT_METRICS_QUERY_TIMEOUT_SECONDS: u64 = 30;

/// The module-wide result type.
type Result<T> = std::result::Result<T, config_error::Error>;

#[derive(Debug, Clone)]
pub struct Config {
    pub prometheus_address: String,
    pub prometheus_org_id: Option<String>,
    pub resource: ResourceKind,
    pub threshold_percentage: f64,
    pub allowed_pools: Vec<String>,
    pub pool_label_key: String,
    pub identity_source: IdentitySource,
    pub match_strategy: MatchStrategy,
    pub critical_namespaces: Vec<String>,
    pub protect_statefulset: bool,
    pub drain_timeout: Duration,
    pub poll_interval: Duration,
    pub pod_grace_period_seconds: u32,
    pub delete_throttle: Duration,
    pub query_timeout: Duration,
}

impl Config {
    pub fn from_environment() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a `Config` from any variable lookup. Factored out of `from_environment`
    /// so tests can exercise parsing without touching process-global state.
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prometheus_address = lookup(PROMETHEUS_ADDRESS_ENV_VAR)
            .context(config_error::MissingEnvSnafu {
                var: PROMETHEUS_ADDRESS_ENV_VAR,
            })?;

        let allowed_pools = lookup(DRAIN_NODE_POOLS_ENV_VAR)
            .context(config_error::MissingEnvSnafu {
                var: DRAIN_NODE_POOLS_ENV_VAR,
            })?
            .split(',')
            .map(|pool| pool.trim().to_string())
            .filter(|pool| !pool.is_empty())
            .collect::<Vec<_>>();

        let critical_namespaces = lookup(CRITICAL_NAMESPACES_ENV_VAR)
            .unwrap_or_else(|| constants::DEFAULT_CRITICAL_NAMESPACE.to_string())
            .split(',')
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect::<Vec<_>>();

        Ok(Config {
            prometheus_address,
            prometheus_org_id: lookup(PROMETHEUS_SCOPE_ORG_ID_ENV_VAR),
            resource: parse_enum_or(&lookup, DRAIN_RESOURCE_ENV_VAR, ResourceKind::Disk)?,
            threshold_percentage: parse_or(
                &lookup,
                DRAIN_THRESHOLD_PERCENTAGE_ENV_VAR,
                DEFAULT_THRESHOLD_PERCENTAGE,
            )?,
            allowed_pools,
            pool_label_key: lookup(NODE_POOL_LABEL_KEY_ENV_VAR)
                .unwrap_or_else(|| constants::NODE_POOL_LABEL.to_string()),
            identity_source: parse_enum_or(
                &lookup,
                NODE_IDENTITY_SOURCE_ENV_VAR,
                IdentitySource::InstanceAddress,
            )?,
            match_strategy: parse_enum_or(
                &lookup,
                NODE_MATCH_STRATEGY_ENV_VAR,
                MatchStrategy::Substring,
            )?,
            critical_namespaces,
            protect_statefulset: parse_or(&lookup, PROTECT_STATEFULSET_PODS_ENV_VAR, true)?,
            drain_timeout: Duration::from_secs(parse_or(
                &lookup,
                DRAIN_TIMEOUT_SECONDS_ENV_VAR,
                DEFAULT_DRAIN_TIMEOUT_SECONDS,
            )?),
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                POLL_INTERVAL_SECONDS_ENV_VAR,
                DEFAULT_POLL_INTERVAL_SECONDS,
            )?),
            pod_grace_period_seconds: parse_or(
                &lookup,
                POD_GRACE_PERIOD_SECONDS_ENV_VAR,
                DEFAULT_POD_GRACE_PERIOD_SECONDS,
            )?,
            delete_throttle: Duration::from_millis(parse_or(
                &lookup,
                DELETE_THROTTLE_MILLIS_ENV_VAR,
                DEFAULT_DELETE_THROTTLE_MILLIS,
            )?),
            query_timeout: Duration::from_secs(parse_or(
                &lookup,
                METRICS_QUERY_TIMEOUT_SECONDS_ENV_VAR,
                DEFAULT_METRICS_QUERY_TIMEOUT_SECONDS,
            )?),
        })
    }

    pub fn selector_settings(&self) -> SelectorSettings {
        SelectorSettings {
            pool_label_key: self.pool_label_key.clone(),
            allowed_pools: self.allowed_pools.clone(),
            match_strategy: self.match_strategy,
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            protect_statefulset: self.protect_statefulset,
            critical_namespaces: self.critical_namespaces.clone(),
        }
    }

    pub fn drain_tunables(&self) -> DrainTunables {
        DrainTunables {
            drain_timeout: self.drain_timeout,
            poll_interval: self.poll_interval,
            pod_grace_period_seconds: self.pod_grace_period_seconds,
            delete_throttle: self.delete_throttle,
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value
                .parse()
                .map_err(|err: T::Err| config_error::Error::InvalidEnv {
                    var,
                    value: value.clone(),
                    reason: err.to_string(),
                })
        })
        .unwrap_or(Ok(default))
}

fn parse_enum_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: serde::de::DeserializeOwned,
{
    lookup(var)
        .map(|value| {
            serde_plain::from_str(&value).map_err(|err| config_error::Error::InvalidEnv {
                var,
                value: value.clone(),
                reason: err.to_string(),
            })
        })
        .unwrap_or(Ok(default))
}

pub mod config_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Required environment variable '{}' is not set", var))]
        MissingEnv { var: &'static str },

        #[snafu(display(
            "Could not parse environment variable '{}={}': {}",
            var,
            value,
            reason
        ))]
        InvalidEnv {
            var: &'static str,
            value: String,
            reason: String,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use std::collections::HashMap;

    fn lookup_from(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |var| map.get(var).map(|v| v.to_string())
    }

    #[test]
    fn minimal_environment_uses_defaults() {
        let lookup = lookup_from(hashmap! {
            "PROMETHEUS_ADDRESS" => "http://prometheus:9090",
            "DRAIN_NODE_POOLS" => "batch, spot-workers",
        });

        let config = Config::from_lookup(lookup).unwrap();
        assert_eq!(config.prometheus_address, "http://prometheus:9090");
        assert_eq!(config.allowed_pools, vec!["batch", "spot-workers"]);
        assert_eq!(config.threshold_percentage, DEFAULT_THRESHOLD_PERCENTAGE);
        assert_eq!(config.resource, ResourceKind::Disk);
        assert_eq!(config.match_strategy, MatchStrategy::Substring);
        assert_eq!(config.critical_namespaces, vec!["kube-system"]);
        assert!(config.protect_statefulset);
        assert_eq!(
            config.drain_timeout,
            Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECONDS)
        );
    }

    #[test]
    fn missing_required_variables_fail() {
        let err = Config::from_lookup(lookup_from(hashmap! {
            "DRAIN_NODE_POOLS" => "batch",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("PROMETHEUS_ADDRESS"));
    }

    #[test]
    fn overrides_are_parsed() {
        let lookup = lookup_from(hashmap! {
            "PROMETHEUS_ADDRESS" => "http://prometheus:9090",
            "DRAIN_NODE_POOLS" => "batch",
            "DRAIN_RESOURCE" => "memory",
            "DRAIN_THRESHOLD_PERCENTAGE" => "85.5",
            "NODE_MATCH_STRATEGY" => "exact",
            "NODE_IDENTITY_SOURCE" => "node-label",
            "PROTECT_STATEFULSET_PODS" => "false",
            "POLL_INTERVAL_SECONDS" => "2",
        });

        let config = Config::from_lookup(lookup).unwrap();
        assert_eq!(config.resource, ResourceKind::Memory);
        assert_eq!(config.threshold_percentage, 85.5);
        assert_eq!(config.match_strategy, MatchStrategy::Exact);
        assert_eq!(config.identity_source, IdentitySource::NodeLabel);
        assert!(!config.protect_statefulset);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn malformed_numeric_override_fails() {
        let lookup = lookup_from(hashmap! {
            "PROMETHEUS_ADDRESS" => "http://prometheus:9090",
            "DRAIN_NODE_POOLS" => "batch",
            "DRAIN_TIMEOUT_SECONDS" => "not-a-number",
        });
        assert!(Config::from_lookup(lookup).is_err());
    }
}
