use controller::config::Config;
use controller::metrics::PrometheusSource;
use controller::run_drain;
use controller::terminator::Ec2InstanceTerminator;
use models::node::K8sNodeClient;
use models::telemetry;

use argh::FromArgs;
use snafu::ResultExt;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, launch_error::Error>;

#[derive(FromArgs, Debug)]
/// Cordon, drain and terminate cluster nodes selected by resource utilization metrics.
struct Args {
    /// report drain candidates without mutating the cluster
    #[argh(switch)]
    dry_run: bool,
    /// override the configured utilization threshold percentage
    #[argh(option)]
    threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    telemetry::init_telemetry_from_env().context(launch_error::TelemetryInitSnafu)?;
    let config = Config::from_environment().context(launch_error::ConfigSnafu)?;

    // Infers in-cluster configuration when deployed, kubeconfig when run by an operator.
    let k8s_client = kube::Client::try_default()
        .await
        .context(launch_error::ClientCreateSnafu)?;
    let node_client = K8sNodeClient::new(k8s_client);

    let metrics_source = PrometheusSource::new(
        config.prometheus_address.clone(),
        config.prometheus_org_id.clone(),
        config.identity_source,
    )
    .context(launch_error::MetricsClientSnafu)?;

    let shared_config = aws_config::from_env().load().await;
    let terminator = Ec2InstanceTerminator::new(&shared_config);

    let report = run_drain(
        node_client,
        &metrics_source,
        terminator,
        &config,
        args.threshold,
        args.dry_run,
    )
    .await
    .context(launch_error::RunSnafu)?;

    event!(
        Level::INFO,
        candidates = report.candidates.len(),
        outcomes = report.outcomes.len(),
        "Drain run complete."
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context(launch_error::ReportSerializeSnafu)?
    );

    Ok(())
}

pub mod launch_error {
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },

        #[snafu(display("Unable to load configuration from the environment: '{}'", source))]
        Config {
            source: controller::config::config_error::Error,
        },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Unable to create metrics client: '{}'", source))]
        MetricsClient {
            source: controller::metrics::metrics_error::Error,
        },

        #[snafu(display("Drain run failed: '{}'", source))]
        Run {
            source: controller::run_error::Error,
        },

        #[snafu(display("Unable to serialize run report: '{}'", source))]
        ReportSerialize { source: serde_json::Error },
    }
}
