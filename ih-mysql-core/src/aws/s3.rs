//! S3 backed blob store

use async_trait::async_trait;

use super::cli::{has_code, AwsCli};
use crate::abstractions::CommandOptions;
use crate::error::BootstrapResult;
use crate::services::BlobStore;

const MISSING_OBJECT_CODES: &[&str] = &["404", "NoSuchKey", "NotFound"];

pub struct S3Store {
    cli: AwsCli,
}

impl S3Store {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

fn uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

#[async_trait]
impl BlobStore for S3Store {
    async fn head(&self, bucket: &str, key: &str) -> BootstrapResult<Option<u64>> {
        match self
            .cli
            .call("s3api", "head-object", &["--bucket", bucket, "--key", key])
            .await
        {
            Ok(response) => Ok(response["ContentLength"].as_u64()),
            Err(e) if has_code(&e, MISSING_OBJECT_CODES) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> BootstrapResult<Option<Vec<u8>>> {
        let source = uri(bucket, key);
        match self
            .cli
            .run("s3", "cp", &[&source, "-"], CommandOptions::new())
            .await
        {
            Ok(output) => Ok(Some(output.stdout)),
            Err(e) if has_code(&e, MISSING_OBJECT_CODES) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> BootstrapResult<()> {
        let destination = uri(bucket, key);
        self.cli
            .run(
                "s3",
                "cp",
                &["-", &destination],
                CommandOptions::new().with_stdin(body),
            )
            .await?;
        Ok(())
    }
}
