use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::fmt::format::FmtSpan;

use bucketcheck_aws::{AwsProvider, S3Inspector};
use bucketcheck_core::{BucketName, ExpectedProperties, ProvisionVars, Report, DEFAULT_PREFIX};
use bucketcheck_policy::{run_conformance, Policy};
use bucketcheck_tfcompat::{self as tfc, Provisioner, RetryPolicy, Tool, ToolOptions};

const DEFAULT_ROOT: &str = "infra";
const DEFAULT_DIR: &str = "infra/terragrunt/environments/dev/s3-bucket";
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Parser, Debug)]
#[command(author, version, about="bucketcheck — provision an S3 bucket with Terragrunt/Terraform and verify its configuration")]
struct Cli {
    /// Settings file (YAML); flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Provisioning directory
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Tree copied per bucket; defaults to --dir, or `infra` for the bundled unit
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Runner
    #[arg(long, value_enum, global = true)]
    runner: Option<Runner>,

    #[arg(long, global = true)]
    region: Option<String>,

    #[arg(long, global = true)]
    owner: Option<String>,

    #[arg(long, global = true)]
    environment: Option<String>,

    /// Prefix for generated bucket names
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// S3-compatible endpoint for the state queries
    #[arg(long, global = true)]
    endpoint_url: Option<String>,

    /// Write the report as JSON to this path
    #[arg(long, global = true)]
    report_json: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Runner { Auto, Terragrunt, Terraform, Tofu }

#[derive(Subcommand, Debug)] enum Cmd {
    /// Generate a bucket name, provision, check, destroy
    Run,
    /// Check an existing bucket without provisioning
    Check { #[arg(long)] bucket: String },
    /// Destroy a bucket provisioned earlier under this name
    Destroy { #[arg(long)] bucket: String },
}

#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    dir: Option<PathBuf>,
    root: Option<PathBuf>,
    /// Parent of the per-bucket working copies
    work_dir: Option<PathBuf>,
    runner: Option<Runner>,
    binary: Option<PathBuf>,
    region: Option<String>,
    owner: Option<String>,
    environment: Option<String>,
    bucket_prefix: Option<String>,
    enable_logging: Option<bool>,
    endpoint_url: Option<String>,
    retry: RetrySettings,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
struct RetrySettings { max_retries: Option<u32>, pause_secs: Option<u64> }

impl Settings {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read settings {}", path.display()))?;
        serde_yaml::from_slice(&raw).with_context(|| format!("parse settings {}", path.display()))
    }

    /// Flags win over the file.
    fn overlay(mut self, cli: &Cli) -> Self {
        fn pick<T: Clone>(flag: &Option<T>, file: &mut Option<T>) {
            if flag.is_some() { *file = flag.clone(); }
        }
        pick(&cli.dir, &mut self.dir);
        pick(&cli.root, &mut self.root);
        pick(&cli.runner, &mut self.runner);
        pick(&cli.region, &mut self.region);
        pick(&cli.owner, &mut self.owner);
        pick(&cli.environment, &mut self.environment);
        pick(&cli.prefix, &mut self.bucket_prefix);
        pick(&cli.endpoint_url, &mut self.endpoint_url);
        self
    }

    fn region(&self) -> String { self.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()) }

    fn vars(&self, bucket_name: BucketName) -> ProvisionVars {
        let mut vars = ProvisionVars::new(bucket_name);
        if let Some(o) = &self.owner { vars.owner = o.clone(); }
        if let Some(e) = &self.environment { vars.environment = e.clone(); }
        if let Some(l) = self.enable_logging { vars.enable_logging = l; }
        vars
    }

    fn retry(&self) -> RetryPolicy {
        let mut p = RetryPolicy::default();
        if let Some(n) = self.retry.max_retries { p.max_retries = n; }
        if let Some(s) = self.retry.pause_secs { p.pause = Duration::from_secs(s); }
        p
    }

    fn provider(&self) -> AwsProvider {
        AwsProvider { region: self.region(), endpoint_url: self.endpoint_url.clone() }
    }

    /// Provisioning directory and the tree copied around it.
    fn layout(&self) -> (PathBuf, PathBuf) {
        match (&self.dir, &self.root) {
            (None, None) => (PathBuf::from(DEFAULT_ROOT), PathBuf::from(DEFAULT_DIR)),
            (None, Some(root)) => (root.clone(), PathBuf::from(DEFAULT_DIR)),
            (Some(dir), root) => (root.clone().unwrap_or_else(|| dir.clone()), dir.clone()),
        }
    }

    fn tool(&self, vars: ProvisionVars) -> Result<Tool> {
        let (root, dir) = self.layout();
        tfc::ensure_dir(&dir)?;
        let work_base = self.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let prefer = match self.runner.unwrap_or(Runner::Auto) {
            Runner::Terragrunt => Some(tfc::Runner::Terragrunt),
            Runner::Terraform  => Some(tfc::Runner::Terraform),
            Runner::Tofu       => Some(tfc::Runner::Tofu),
            Runner::Auto       => None,
        };
        let runner = tfc::pick_runner(prefer)?;
        Ok(Tool::new(ToolOptions {
            runner,
            binary: self.binary.clone(),
            root,
            dir,
            work_base,
            region: self.region(),
            vars,
            retry: self.retry(),
        }))
    }
}

fn finish(report: &Report, json_out: Option<&Path>) -> Result<()> {
    println!("{}", report.summary());
    if let Some(p) = json_out {
        std::fs::write(p, serde_json::to_string_pretty(report)?).with_context(|| format!("write report {}", p.display()))?;
    }
    let failed = report.outcomes.iter().filter(|o| !o.passed()).count();
    if failed > 0 { anyhow::bail!("{failed} of {} checks did not pass", report.outcomes.len()) }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().json().with_writer(std::io::stderr).with_span_events(FmtSpan::CLOSE).init();
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(p) => Settings::load(p)?,
        None => Settings::default(),
    }.overlay(&cli);

    match &cli.cmd {
      Cmd::Run => {
          let prefix = settings.bucket_prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
          let name = BucketName::generate(prefix)?;
          let vars = settings.vars(name.clone());
          let policy = Policy::standard(ExpectedProperties::for_vars(&vars));
          let tool = settings.tool(vars)?;
          let s3 = S3Inspector::connect(&settings.provider()).await;
          let span = tracing::info_span!("conformance", bucket = %name);
          let run = run_conformance(&tool, &s3, &policy, &name).instrument(span).await?;
          if let Err(e) = &run.teardown {
              tracing::error!(bucket = %name, error = %format!("{e:#}"), "teardown failed; bucket may still exist");
          }
          finish(&run.report, cli.report_json.as_deref())?;
          run.teardown?;
      },
      Cmd::Check { bucket } => {
          let name = BucketName::parse(bucket.as_str())?;
          let policy = Policy::standard(ExpectedProperties::for_vars(&settings.vars(name.clone())));
          let s3 = S3Inspector::connect(&settings.provider()).await;
          let report = policy.evaluate(&s3, &name).await;
          finish(&report, cli.report_json.as_deref())?;
      },
      Cmd::Destroy { bucket } => {
          let name = BucketName::parse(bucket.as_str())?;
          settings.tool(settings.vars(name))?.destroy()?;
      },
    }
    Ok(())
}
