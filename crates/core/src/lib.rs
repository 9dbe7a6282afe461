use serde::{Serialize, Deserialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "terratest-s3";
/// Environment variable the Terragrunt unit reads the environment name from.
pub const ENVIRONMENT_ENV: &str = "TG_VAR_environment";
/// Same value as a Terraform input variable, for plain terraform/tofu runs.
pub const TF_ENVIRONMENT_ENV: &str = "TF_VAR_environment";
pub const REGION_ENV: &str = "AWS_REGION";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid bucket name '{name}': {reason}")]
    InvalidBucketName { name: String, reason: &'static str },
    #[error("output '{0}' not found in provisioning outputs")]
    OutputMissing(String),
    #[error("output '{0}' is not a scalar value")]
    OutputNotScalar(String),
    #[error("provisioned bucket '{actual}' does not match requested name '{expected}'")]
    IdentifierMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketName(pub String);

impl BucketName {
    /// Prefix plus 48 random bits rendered as lowercase hex.
    pub fn generate(prefix: &str) -> Result<Self, CoreError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::parse(format!("{}-{}", prefix.to_ascii_lowercase(), &suffix[..12]))
    }

    pub fn parse(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let bad = |reason: &'static str| -> Result<Self, CoreError> {
            Err(CoreError::InvalidBucketName { name: name.clone(), reason })
        };
        if name.len() < 3 || name.len() > 63 {
            return bad("length must be between 3 and 63");
        }
        if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.') {
            return bad("use lowercase letters, digits, '-' and '.' only");
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
            return bad("must begin and end with a letter or digit");
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Inputs recognised by the bucket module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionVars {
    pub bucket_name: BucketName,
    pub owner: String,
    pub environment: String,
    pub enable_logging: bool,
}

impl ProvisionVars {
    pub fn new(bucket_name: BucketName) -> Self {
        Self { bucket_name, owner: "terratest".into(), environment: "test".into(), enable_logging: false }
    }

    /// `-var` flags. `environment` travels through [`ENVIRONMENT_ENV`] instead.
    pub fn var_flags(&self) -> Vec<String> {
        let pairs = [
            ("bucket_name", self.bucket_name.0.clone()),
            ("owner", self.owner.clone()),
            ("enable_logging", self.enable_logging.to_string()),
        ];
        pairs.into_iter().flat_map(|(k, v)| ["-var".to_string(), format!("{k}={v}")]).collect()
    }

    pub fn env(&self, region: &str) -> Vec<(String, String)> {
        vec![
            (REGION_ENV.to_string(), region.to_string()),
            (ENVIRONMENT_ENV.to_string(), self.environment.clone()),
        ]
    }
}

/// Outputs recorded by the provisioning tool after apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSet(pub BTreeMap<String, Json>);

impl OutputSet {
    /// Accepts the `output -json` document: `{ name: { "value": .., "type": .., "sensitive": .. } }`.
    pub fn from_output_json(doc: &Json) -> Self {
        let mut out = BTreeMap::new();
        if let Some(obj) = doc.as_object() {
            for (name, entry) in obj {
                let v = entry.get("value").cloned().unwrap_or_else(|| entry.clone());
                out.insert(name.clone(), v);
            }
        }
        Self(out)
    }

    pub fn get(&self, name: &str) -> Result<String, CoreError> {
        match self.0.get(name) {
            None => Err(CoreError::OutputMissing(name.to_string())),
            Some(Json::String(s)) => Ok(s.clone()),
            Some(v @ (Json::Number(_) | Json::Bool(_))) => Ok(v.to_string()),
            Some(_) => Err(CoreError::OutputNotScalar(name.to_string())),
        }
    }

    /// Reads `bucket_id` and insists it is the bucket that was requested.
    pub fn bucket_id(&self, requested: &BucketName) -> Result<BucketName, CoreError> {
        let actual = self.get("bucket_id")?;
        if actual != requested.0 {
            return Err(CoreError::IdentifierMismatch { expected: requested.0.clone(), actual });
        }
        Ok(requested.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessExpectation {
    pub block_public_acls: bool,
    pub block_public_policy: bool,
    pub ignore_public_acls: bool,
    pub restrict_public_buckets: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedProperties {
    pub sse_algorithm: String,
    pub tags: BTreeMap<String, String>,
    pub required_tag_keys: Vec<String>,
    pub public_access: PublicAccessExpectation,
    pub versioning_status: String,
    pub secure_transport_key: String,
    pub policy_must_contain: Vec<String>,
}

impl ExpectedProperties {
    pub fn for_vars(vars: &ProvisionVars) -> Self {
        let tags = BTreeMap::from([
            ("environment".to_string(), vars.environment.clone()),
            ("owner".to_string(), vars.owner.clone()),
        ]);
        Self {
            sse_algorithm: "AES256".into(),
            tags,
            required_tag_keys: vec!["Project".into(), "CostCenter".into()],
            public_access: PublicAccessExpectation {
                block_public_acls: true,
                block_public_policy: true,
                ignore_public_acls: true,
                restrict_public_buckets: true,
            },
            versioning_status: "Enabled".into(),
            secure_transport_key: "aws:SecureTransport".into(),
            policy_must_contain: vec!["aws:SecureTransport".into(), "false".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Passed,
    Failed { failures: Vec<String> },
    Errored { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: Status,
}

impl CheckOutcome {
    pub fn from_failures(name: &str, failures: Vec<String>) -> Self {
        let status = if failures.is_empty() { Status::Passed } else { Status::Failed { failures } };
        Self { name: name.to_string(), status }
    }
    pub fn errored(name: &str, err: impl fmt::Display) -> Self {
        Self { name: name.to_string(), status: Status::Errored { error: err.to_string() } }
    }
    pub fn passed(&self) -> bool { self.status == Status::Passed }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub bucket: BucketName,
    pub outcomes: Vec<CheckOutcome>,
}

impl Report {
    pub fn is_success(&self) -> bool { self.outcomes.iter().all(CheckOutcome::passed) }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for o in &self.outcomes {
            match &o.status {
                Status::Passed => lines.push(format!("PASS  {}", o.name)),
                Status::Failed { failures: msgs } => {
                    lines.push(format!("FAIL  {}", o.name));
                    lines.extend(msgs.iter().map(|m| format!("        {m}")));
                }
                Status::Errored { error: msg } => lines.push(format!("ERROR {}: {msg}", o.name)),
            }
        }
        let passed = self.outcomes.iter().filter(|o| o.passed()).count();
        lines.push(format!("{passed}/{} checks passed for bucket {}", self.outcomes.len(), self.bucket));
        lines.join("\n")
    }
}
