use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsProvider {
    pub region: String,
    /// S3-compatible endpoint (LocalStack, MinIO). Implies path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl AwsProvider {
    pub fn new(region: impl Into<String>) -> Self { Self { region: region.into(), endpoint_url: None } }

    pub async fn s3_client(&self) -> Client {
        tracing::debug!(region = %self.region, endpoint = ?self.endpoint_url, "building S3 client");
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(self.region.clone()));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if self.endpoint_url.is_some() {
            builder = builder.force_path_style(true);
        }
        Client::from_conf(builder.build())
    }
}

/// Default encryption rule as reported by `GetBucketEncryption`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRule {
    pub sse_algorithm: Option<String>,
    pub kms_master_key_id: Option<String>,
}

/// Flags reported by `GetPublicAccessBlock`; an unset flag reads as false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub block_public_policy: bool,
    pub ignore_public_acls: bool,
    pub restrict_public_buckets: bool,
}

/// Read-only view of a bucket's live configuration. Nothing is cached.
#[async_trait]
pub trait BucketInspector: Send + Sync {
    async fn exists(&self, bucket: &str) -> Result<()>;
    async fn encryption_rules(&self, bucket: &str) -> Result<Vec<EncryptionRule>>;
    async fn tags(&self, bucket: &str) -> Result<BTreeMap<String, String>>;
    async fn public_access_block(&self, bucket: &str) -> Result<PublicAccessBlock>;
    /// `None` when versioning was never configured.
    async fn versioning_status(&self, bucket: &str) -> Result<Option<String>>;
    async fn policy(&self, bucket: &str) -> Result<String>;
}

pub struct S3Inspector { client: Client }

impl S3Inspector {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn connect(provider: &AwsProvider) -> Self { Self::new(provider.s3_client().await) }
}

#[async_trait]
impl BucketInspector for S3Inspector {
    async fn exists(&self, bucket: &str) -> Result<()> {
        self.client.head_bucket().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("head bucket {bucket}"))?;
        Ok(())
    }

    async fn encryption_rules(&self, bucket: &str) -> Result<Vec<EncryptionRule>> {
        let out = self.client.get_bucket_encryption().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("get bucket encryption for {bucket}"))?;
        let rules = out.server_side_encryption_configuration()
            .map(|cfg| cfg.rules())
            .unwrap_or_default();
        Ok(rules.iter().map(|rule| {
            let default = rule.apply_server_side_encryption_by_default();
            EncryptionRule {
                sse_algorithm: default.map(|d| d.sse_algorithm().as_str().to_string()),
                kms_master_key_id: default.and_then(|d| d.kms_master_key_id()).map(str::to_string),
            }
        }).collect())
    }

    async fn tags(&self, bucket: &str) -> Result<BTreeMap<String, String>> {
        let out = self.client.get_bucket_tagging().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("get bucket tagging for {bucket}"))?;
        Ok(out.tag_set().iter().map(|t| (t.key().to_string(), t.value().to_string())).collect())
    }

    async fn public_access_block(&self, bucket: &str) -> Result<PublicAccessBlock> {
        let out = self.client.get_public_access_block().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("get public access block for {bucket}"))?;
        let Some(cfg) = out.public_access_block_configuration() else {
            return Ok(PublicAccessBlock::default());
        };
        Ok(PublicAccessBlock {
            block_public_acls: cfg.block_public_acls().unwrap_or(false),
            block_public_policy: cfg.block_public_policy().unwrap_or(false),
            ignore_public_acls: cfg.ignore_public_acls().unwrap_or(false),
            restrict_public_buckets: cfg.restrict_public_buckets().unwrap_or(false),
        })
    }

    async fn versioning_status(&self, bucket: &str) -> Result<Option<String>> {
        let out = self.client.get_bucket_versioning().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("get bucket versioning for {bucket}"))?;
        Ok(out.status().map(|s| s.as_str().to_string()))
    }

    async fn policy(&self, bucket: &str) -> Result<String> {
        let out = self.client.get_bucket_policy().bucket(bucket).send().await
            .map_err(aws_sdk_s3::Error::from)
            .with_context(|| format!("get bucket policy for {bucket}"))?;
        out.policy().map(str::to_string).with_context(|| format!("bucket {bucket} returned an empty policy"))
    }
}
