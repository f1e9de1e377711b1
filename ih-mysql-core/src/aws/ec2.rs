//! EC2 and Auto Scaling backed fleet directory

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::cli::AwsCli;
use crate::error::{BootstrapError, BootstrapResult};
use crate::services::FleetDirectory;
use crate::types::{InstanceDescription, NodeTags};

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: u32 = 21600;

/// Fleet directory over `aws ec2` and `aws autoscaling`
pub struct Ec2Fleet {
    cli: AwsCli,
    http: reqwest::Client,
    imds_endpoint: String,
    local_instance_id: Option<String>,
}

impl Ec2Fleet {
    pub fn new(cli: AwsCli) -> Self {
        Self {
            cli,
            http: reqwest::Client::new(),
            imds_endpoint: IMDS_ENDPOINT.to_string(),
            local_instance_id: None,
        }
    }

    /// Report `instance_id` as the local instance instead of asking IMDS
    pub fn with_local_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.local_instance_id = instance_id;
        self
    }

    pub fn with_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = endpoint.into();
        self
    }

    /// Read the instance id from IMDSv2
    async fn metadata_instance_id(&self) -> BootstrapResult<String> {
        let token = self
            .http
            .put(format!("{}/latest/api/token", self.imds_endpoint))
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                IMDS_TOKEN_TTL_SECS.to_string(),
            )
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let instance_id = self
            .http
            .get(format!("{}/latest/meta-data/instance-id", self.imds_endpoint))
            .header("X-aws-ec2-metadata-token", token)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(instance_id.trim().to_string())
    }

    async fn group_of(&self, instance_id: &str) -> BootstrapResult<String> {
        let response = self
            .cli
            .call(
                "autoscaling",
                "describe-auto-scaling-instances",
                &["--instance-ids", instance_id],
            )
            .await?;

        response["AutoScalingInstances"]
            .get(0)
            .and_then(|i| i["AutoScalingGroupName"].as_str())
            .map(str::to_string)
            .ok_or_else(|| BootstrapError::Aws {
                operation: "autoscaling describe-auto-scaling-instances".to_string(),
                code: None,
                message: format!("instance {} is not in an Auto Scaling group", instance_id),
            })
    }
}

#[async_trait]
impl FleetDirectory for Ec2Fleet {
    async fn local_instance_id(&self) -> BootstrapResult<String> {
        if let Some(instance_id) = &self.local_instance_id {
            return Ok(instance_id.clone());
        }
        let instance_id = self.metadata_instance_id().await?;
        debug!("Instance metadata reports {}", instance_id);
        Ok(instance_id)
    }

    async fn list_members(&self, group: &str) -> BootstrapResult<Vec<String>> {
        let response = self
            .cli
            .call(
                "autoscaling",
                "describe-auto-scaling-groups",
                &["--auto-scaling-group-names", group],
            )
            .await?;

        let asg = response["AutoScalingGroups"]
            .get(0)
            .ok_or_else(|| BootstrapError::Aws {
                operation: "autoscaling describe-auto-scaling-groups".to_string(),
                code: None,
                message: format!("Auto Scaling group {} not found", group),
            })?;

        Ok(asg["Instances"]
            .as_array()
            .map(|instances| {
                instances
                    .iter()
                    .filter_map(|i| i["InstanceId"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe(&self, instance_id: &str) -> BootstrapResult<InstanceDescription> {
        let response = self
            .cli
            .call("ec2", "describe-instances", &["--instance-ids", instance_id])
            .await?;
        parse_instance(instance_id, &response)
    }

    async fn set_tag(&self, instance_id: &str, key: &str, value: &str) -> BootstrapResult<()> {
        let tags = json!([{ "Key": key, "Value": value }]).to_string();
        self.cli
            .call(
                "ec2",
                "create-tags",
                &["--resources", instance_id, "--tags", &tags],
            )
            .await?;
        debug!("Tagged {} with {}={}", instance_id, key, value);
        Ok(())
    }

    async fn enable_scale_in_protection(&self, instance_id: &str) -> BootstrapResult<()> {
        let group = self.group_of(instance_id).await?;
        self.cli
            .call(
                "autoscaling",
                "set-instance-protection",
                &[
                    "--instance-ids",
                    instance_id,
                    "--auto-scaling-group-name",
                    &group,
                    "--protected-from-scale-in",
                ],
            )
            .await?;
        info!("Protected {} from scale-in in {}", instance_id, group);
        Ok(())
    }
}

fn parse_instance(instance_id: &str, response: &Value) -> BootstrapResult<InstanceDescription> {
    let instance = response["Reservations"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| r["Instances"].as_array())
        .flatten()
        .find(|i| i["InstanceId"].as_str() == Some(instance_id))
        .ok_or_else(|| BootstrapError::Aws {
            operation: "ec2 describe-instances".to_string(),
            code: Some("InvalidInstanceID.NotFound".to_string()),
            message: format!("The instance ID '{}' does not exist", instance_id),
        })?;

    let tags = instance["Tags"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| Some((t["Key"].as_str()?, t["Value"].as_str()?)))
        .collect::<NodeTags>();

    Ok(InstanceDescription {
        instance_id: instance_id.to_string(),
        private_ip: instance["PrivateIpAddress"].as_str().map(str::to_string),
        tags,
    })
}
