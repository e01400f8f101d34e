//! Terminates the compute instance backing a drained node.

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt};
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, terminator_error::Error>;

#[async_trait]
/// A thin, single-call boundary to the cloud provider. Provided as a trait so the
/// orchestrator can be tested without an AWS account.
pub trait InstanceTerminator: Send + Sync {
    async fn terminate(&self, instance_id: &str) -> Result<()>;
}

#[cfg(test)]
mock! {
    pub InstanceTerminator {}
    #[async_trait]
    impl InstanceTerminator for InstanceTerminator {
        async fn terminate(&self, instance_id: &str) -> Result<()>;
    }
}

/// Terminates EC2 instances by id.
#[derive(Clone)]
pub struct Ec2InstanceTerminator {
    ec2_client: aws_sdk_ec2::Client,
}

impl Ec2InstanceTerminator {
    pub fn new(shared_config: &aws_config::SdkConfig) -> Self {
        Ec2InstanceTerminator {
            ec2_client: aws_sdk_ec2::Client::new(shared_config),
        }
    }
}

#[async_trait]
impl InstanceTerminator for Ec2InstanceTerminator {
    #[instrument(skip(self), err)]
    async fn terminate(&self, instance_id: &str) -> Result<()> {
        self.ec2_client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)
            .context(terminator_error::TerminateInstanceSnafu {
                instance_id: instance_id.to_string(),
            })?;

        event!(Level::INFO, %instance_id, "Instance termination requested.");
        Ok(())
    }
}

/// Extracts the EC2 instance id from a node's `spec.providerID`, which has the form
/// `aws:///<availability-zone>/<instance-id>`.
///
/// A malformed identity is terminal for the node's drain, not retryable: the node is
/// already drained, and an operator has to decide what it actually is.
pub fn instance_id_from_provider_id(provider_id: &str) -> Result<String> {
    provider_id
        .rsplit('/')
        .next()
        .filter(|id| id.starts_with("i-") && id.len() > 2)
        .map(|id| id.to_string())
        .context(terminator_error::MalformedProviderIdSnafu {
            provider_id: provider_id.to_string(),
        })
}

pub mod terminator_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to terminate instance '{}': '{}'", instance_id, source))]
        TerminateInstance {
            source: aws_sdk_ec2::Error,
            instance_id: String,
        },

        #[snafu(display(
            "Provider id '{}' does not contain an instance id",
            provider_id
        ))]
        MalformedProviderId { provider_id: String },
    }
}
