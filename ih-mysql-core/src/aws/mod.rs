//! Collaborators backed by the `aws` command-line client
//!
//! Every call goes through [`AwsCli`] and therefore through a
//! [`CommandExecutor`], so each collaborator can be exercised against
//! [`crate::abstractions::MockCommandExecutor`].

pub mod cli;
pub mod dynamodb;
pub mod ec2;
pub mod elb;
pub mod s3;
pub mod secrets;
pub mod ssm;

pub use cli::AwsCli;
pub use dynamodb::DynamoDbTable;
pub use ec2::Ec2Fleet;
pub use elb::ElbTargets;
pub use s3::S3Store;
pub use secrets::SecretsManager;
pub use ssm::{LocalChannel, SsmChannel};

use std::sync::Arc;

use crate::abstractions::{Clock, CommandExecutor, SystemClock, TokioFileSystem};
use crate::config::{BootstrapConfig, CommandChannelKind};
use crate::services::{ClusterServices, CommandChannel};

/// Wire AWS-backed collaborators for `config`
pub fn cluster_services(
    config: &BootstrapConfig,
    executor: Arc<dyn CommandExecutor>,
) -> ClusterServices {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let cli = AwsCli::new(executor.clone(), &config.aws);

    let commands: Arc<dyn CommandChannel> = match config.command_channel {
        CommandChannelKind::Ssm => Arc::new(SsmChannel::new(cli.clone(), clock.clone())),
        CommandChannelKind::Local => Arc::new(LocalChannel::new(executor)),
    };

    ClusterServices {
        table: Arc::new(DynamoDbTable::new(
            cli.clone(),
            config.dynamodb_table.clone(),
            clock.clone(),
            config.lock_lease,
        )),
        fleet: Arc::new(
            Ec2Fleet::new(cli.clone()).with_local_instance_id(config.instance_id.clone()),
        ),
        secrets: Arc::new(SecretsManager::new(cli.clone())),
        blobs: Arc::new(S3Store::new(cli.clone())),
        commands,
        targets: Arc::new(ElbTargets::new(cli)),
        clock,
        fs: Arc::new(TokioFileSystem::new()),
    }
}
