use super::Policy;
use anyhow::{Context, Result};
use bucketcheck_aws::BucketInspector;
use bucketcheck_core::{BucketName, Report};
use bucketcheck_tfcompat::{Provisioner, TeardownGuard};

/// Result of a full provision/check/destroy run.
pub struct Conformance {
    pub report: Report,
    /// Destroy outcome; a failure here leaves the report intact.
    pub teardown: Result<()>,
}

/// Provisions `requested`, checks it against `policy` and destroys it.
///
/// Teardown is armed before apply and runs on every path out of this
/// function. Errors from apply, output reading or the bucket identity are
/// returned after teardown. Provisioner calls block the executor thread for
/// the duration of each tool invocation.
pub async fn run_conformance<P: Provisioner>(
    tool: &P,
    s3: &dyn BucketInspector,
    policy: &Policy,
    requested: &BucketName,
) -> Result<Conformance> {
    let guard = TeardownGuard::arm(tool);

    tracing::info!(bucket = %requested, "provisioning");
    tool.init_and_apply().context("provision bucket")?;

    let outputs = tool.outputs().context("read provisioning outputs")?;
    let bucket = outputs.bucket_id(requested)?;
    tracing::info!(bucket = %bucket, "provisioned; running checks");

    let report = policy.evaluate(s3, &bucket).await;
    let teardown = guard.release().context("destroy bucket");
    Ok(Conformance { report, teardown })
}
