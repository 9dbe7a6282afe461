//! The standard bucket checks.
//!
//! Algorithm, status and tag values compare exactly; policy text is matched
//! by substring; required tag keys by set membership.

use super::Check;
use anyhow::Result;
use async_trait::async_trait;
use bucketcheck_aws::BucketInspector;
use bucketcheck_core::ExpectedProperties;
use serde_json::Value as Json;

pub fn standard() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(BucketExists),
        Box::new(Encryption),
        Box::new(Tags),
        Box::new(PublicAccessBlock),
        Box::new(Versioning),
        Box::new(TransportPolicy),
    ]
}

fn mismatch(field: &str, expected: &str, actual: Option<&str>) -> Option<String> {
    match actual {
        Some(a) if a == expected => None,
        Some(a) => Some(format!("{field}: expected '{expected}', got '{a}'")),
        None => Some(format!("{field}: expected '{expected}', got nothing")),
    }
}

pub struct BucketExists;

#[async_trait]
impl Check for BucketExists {
    fn name(&self) -> &'static str { "bucket_exists" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, _: &ExpectedProperties) -> Result<Vec<String>> {
        s3.exists(bucket).await?;
        Ok(Vec::new())
    }
}

pub struct Encryption;

#[async_trait]
impl Check for Encryption {
    fn name(&self) -> &'static str { "encryption" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, exp: &ExpectedProperties) -> Result<Vec<String>> {
        let rules = s3.encryption_rules(bucket).await?;
        let Some(first) = rules.first() else {
            return Ok(vec!["bucket has no default encryption rules".to_string()]);
        };
        Ok(mismatch("sse_algorithm", &exp.sse_algorithm, first.sse_algorithm.as_deref()).into_iter().collect())
    }
}

pub struct Tags;

#[async_trait]
impl Check for Tags {
    fn name(&self) -> &'static str { "tags" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, exp: &ExpectedProperties) -> Result<Vec<String>> {
        let tags = s3.tags(bucket).await?;
        let mut failures: Vec<String> = exp.tags.iter()
            .filter_map(|(k, v)| mismatch(&format!("tag {k}"), v, tags.get(k).map(String::as_str)))
            .collect();
        for key in &exp.required_tag_keys {
            if !tags.contains_key(key) { failures.push(format!("missing required tag {key}")); }
        }
        Ok(failures)
    }
}

pub struct PublicAccessBlock;

#[async_trait]
impl Check for PublicAccessBlock {
    fn name(&self) -> &'static str { "public_access_block" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, exp: &ExpectedProperties) -> Result<Vec<String>> {
        let got = s3.public_access_block(bucket).await?;
        let want = &exp.public_access;
        let flags = [
            ("BlockPublicAcls", want.block_public_acls, got.block_public_acls),
            ("BlockPublicPolicy", want.block_public_policy, got.block_public_policy),
            ("IgnorePublicAcls", want.ignore_public_acls, got.ignore_public_acls),
            ("RestrictPublicBuckets", want.restrict_public_buckets, got.restrict_public_buckets),
        ];
        Ok(flags.into_iter()
            .filter(|(_, w, g)| w != g)
            .map(|(flag, w, g)| format!("{flag}: expected {w}, got {g}"))
            .collect())
    }
}

pub struct Versioning;

#[async_trait]
impl Check for Versioning {
    fn name(&self) -> &'static str { "versioning" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, exp: &ExpectedProperties) -> Result<Vec<String>> {
        let status = s3.versioning_status(bucket).await?;
        Ok(mismatch("versioning status", &exp.versioning_status, status.as_deref()).into_iter().collect())
    }
}

pub struct TransportPolicy;

#[async_trait]
impl Check for TransportPolicy {
    fn name(&self) -> &'static str { "transport_policy" }
    async fn assess(&self, s3: &dyn BucketInspector, bucket: &str, exp: &ExpectedProperties) -> Result<Vec<String>> {
        let text = s3.policy(bucket).await?;
        let mut failures: Vec<String> = exp.policy_must_contain.iter()
            .filter(|needle| !text.contains(needle.as_str()))
            .map(|needle| format!("policy does not mention '{needle}'"))
            .collect();
        match serde_json::from_str::<Json>(&text) {
            Ok(doc) if denies_insecure_transport(&doc, &exp.secure_transport_key) => {}
            Ok(_) => failures.push(format!("policy has no Deny statement conditioned on {} = false", exp.secure_transport_key)),
            Err(e) => failures.push(format!("policy is not valid JSON: {e}")),
        }
        Ok(failures)
    }
}

/// True if some `Deny` statement carries a condition binding `key` to false.
pub fn denies_insecure_transport(policy: &Json, key: &str) -> bool {
    let statements = match policy.get("Statement") {
        Some(Json::Array(list)) => list.iter().collect::<Vec<_>>(),
        Some(one @ Json::Object(_)) => vec![one],
        _ => return false,
    };
    statements.into_iter()
        .filter(|st| st.get("Effect").and_then(Json::as_str) == Some("Deny"))
        .filter_map(|st| st.get("Condition").and_then(Json::as_object))
        .flat_map(|ops| ops.values())
        .filter_map(Json::as_object)
        .flat_map(|m| m.iter())
        .any(|(k, v)| k.eq_ignore_ascii_case(key) && is_false(v))
}

fn is_false(v: &Json) -> bool {
    match v {
        Json::Bool(b) => !b,
        Json::String(s) => s.eq_ignore_ascii_case("false"),
        Json::Array(items) => items.iter().any(is_false),
        _ => false,
    }
}
