//! ELBv2 target registration

use async_trait::async_trait;
use tracing::info;

use super::cli::AwsCli;
use crate::error::BootstrapResult;
use crate::services::TargetRegistry;

pub struct ElbTargets {
    cli: AwsCli,
}

impl ElbTargets {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl TargetRegistry for ElbTargets {
    async fn register(&self, target_group_arn: &str, instance_id: &str) -> BootstrapResult<()> {
        let target = format!("Id={}", instance_id);
        self.cli
            .call(
                "elbv2",
                "register-targets",
                &["--target-group-arn", target_group_arn, "--targets", &target],
            )
            .await?;
        info!("Registered instance {} with target group {}", instance_id, target_group_arn);
        Ok(())
    }
}
