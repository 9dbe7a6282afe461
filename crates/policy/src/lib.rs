use anyhow::Result;
use async_trait::async_trait;
use bucketcheck_aws::BucketInspector;
use bucketcheck_core::{BucketName, CheckOutcome, ExpectedProperties, Report};

pub mod checks;
mod conformance;

pub use conformance::{run_conformance, Conformance};

/// One facet of a bucket's live configuration.
///
/// `assess` returns the assertion failures it found. An `Err` means the
/// state could not be queried; it fails this check only.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, expected: &ExpectedProperties) -> Result<Vec<String>>;
}

/// Expected properties plus the checks that compare a bucket against them.
pub struct Policy {
    pub expected: ExpectedProperties,
    checks: Vec<Box<dyn Check>>,
}

impl Policy {
    pub fn new(expected: ExpectedProperties, checks: Vec<Box<dyn Check>>) -> Self { Self { expected, checks } }

    /// Existence, encryption, tags, public-access block, versioning, transport policy.
    pub fn standard(expected: ExpectedProperties) -> Self { Self::new(expected, checks::standard()) }

    pub fn check_names(&self) -> Vec<&'static str> { self.checks.iter().map(|c| c.name()).collect() }

    /// Runs every check; none of them can stop the others.
    pub async fn evaluate(&self, s3: &dyn BucketInspector, bucket: &BucketName) -> Report {
        let mut outcomes = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let name = check.name();
            let outcome = match check.assess(s3, bucket.as_str(), &self.expected).await {
                Ok(failures) => {
                    for f in &failures { tracing::warn!(check = name, bucket = %bucket, "{f}"); }
                    CheckOutcome::from_failures(name, failures)
                }
                Err(e) => {
                    tracing::error!(check = name, bucket = %bucket, error = %format!("{e:#}"), "state query failed");
                    CheckOutcome::errored(name, format!("{e:#}"))
                }
            };
            tracing::info!(check = name, passed = outcome.passed(), "check finished");
            outcomes.push(outcome);
        }
        Report { bucket: bucket.clone(), outcomes }
    }
}
