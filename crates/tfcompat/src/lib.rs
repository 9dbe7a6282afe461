use anyhow::{Context, Result};
use bucketcheck_core::{OutputSet, ProvisionVars, TF_ENVIRONMENT_ENV};
use regex::Regex;
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terragrunt, Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner> {
    if let Some(p) = prefer { return Ok(p); }
    if which::which("terragrunt").is_ok() { Ok(Runner::Terragrunt) }
    else if which::which("tofu").is_ok() { Ok(Runner::Tofu) }
    else if which::which("terraform").is_ok() { Ok(Runner::Terraform) }
    else { anyhow::bail!("None of 'terragrunt', 'tofu' or 'terraform' found in PATH") }
}

fn bin(r: Runner) -> &'static str {
    match r { Runner::Terragrunt => "terragrunt", Runner::Terraform => "terraform", Runner::Tofu => "tofu" }
}

/// Failures matching one of `patterns` are retried up to `max_retries` times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub pause: Duration,
    pub patterns: Vec<Regex>,
}

const DEFAULT_RETRYABLE: &[&str] = &[
    r".*read: connection reset by peer.*",
    r".*TLS handshake timeout.*",
    r".*Client\.Timeout exceeded while awaiting headers.*",
    r"(?s).*Error installing provider.*(tcp|TLS|timeout).*",
    r"(?s).*Failed to query available provider packages.*",
    r"(?s).*Could not download module.*",
    r".*Provider produced inconsistent result after apply.*",
    r".*Rate exceeded.*",
    r".*Throttling.*",
    r".*connection refused.*",
];

impl Default for RetryPolicy {
    fn default() -> Self {
        let patterns = DEFAULT_RETRYABLE.iter().filter_map(|p| Regex::new(p).ok()).collect();
        Self { max_retries: 3, pause: Duration::from_secs(5), patterns }
    }
}

impl RetryPolicy {
    pub fn none() -> Self { Self { max_retries: 0, pause: Duration::ZERO, patterns: Vec::new() } }

    pub fn matching(&self, text: &str) -> Option<&Regex> {
        self.patterns.iter().find(|re| re.is_match(text))
    }
}

/// Where and how a provisioning tool is run for one bucket.
#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub runner: Runner,
    /// Overrides the binary looked up for `runner`.
    pub binary: Option<PathBuf>,
    /// Tree copied per bucket so relative module sources keep resolving.
    pub root: PathBuf,
    /// Unit to run in; must sit under `root`.
    pub dir: PathBuf,
    /// Per-bucket copies live under `<work_base>/bucketcheck-<bucket>`.
    pub work_base: PathBuf,
    pub region: String,
    pub vars: ProvisionVars,
    pub retry: RetryPolicy,
}

/// The three lifecycle steps the conformance run needs from a provisioning tool.
///
/// Implementations block the calling thread while the tool runs.
pub trait Provisioner {
    fn init_and_apply(&self) -> Result<()>;
    fn outputs(&self) -> Result<OutputSet>;
    fn destroy(&self) -> Result<()>;
}

fn common_flags() -> Vec<String> {
    vec!["-input=false".to_string(), "-no-color".to_string()]
}

pub fn init_args() -> Vec<String> {
    let mut v = vec!["init".to_string()];
    v.extend(common_flags());
    v
}

pub fn apply_args(vars: &ProvisionVars) -> Vec<String> {
    let mut v = vec!["apply".to_string(), "-auto-approve".to_string()];
    v.extend(common_flags());
    v.extend(vars.var_flags());
    v
}

pub fn destroy_args(vars: &ProvisionVars) -> Vec<String> {
    let mut v = vec!["destroy".to_string(), "-auto-approve".to_string()];
    v.extend(common_flags());
    v.extend(vars.var_flags());
    v
}

pub fn output_args() -> Vec<String> {
    vec!["output".to_string(), "-json".to_string(), "-no-color".to_string()]
}

/// Child environment. Terragrunt reads the environment name through its unit;
/// terraform and tofu take it as a `TF_VAR_`.
pub fn tool_env(r: Runner, vars: &ProvisionVars, region: &str) -> Vec<(String, String)> {
    let mut env = vars.env(region);
    match r {
        Runner::Terragrunt => env.push(("TG_NON_INTERACTIVE".to_string(), "true".to_string())),
        Runner::Terraform | Runner::Tofu => env.push((TF_ENVIRONMENT_ENV.to_string(), vars.environment.clone())),
    }
    env
}

// State and caches from earlier runs must not leak into a fresh copy.
fn skip_entry(name: &str) -> bool {
    name == ".terragrunt-cache" || name == ".terraform" || name.ends_with(".tfstate") || name.ends_with(".tfstate.backup")
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in std::fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if skip_entry(&name.to_string_lossy()) { continue; }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} to {}", entry.path().display(), target.display()))?;
        }
    }
    Ok(())
}

pub struct Tool { opts: ToolOptions }

impl Tool {
    pub fn new(opts: ToolOptions) -> Self { Self { opts } }

    pub fn options(&self) -> &ToolOptions { &self.opts }

    /// Private copy of `root` for this bucket; holds its state and caches.
    pub fn run_root(&self) -> PathBuf {
        self.opts.work_base.join(format!("bucketcheck-{}", self.opts.vars.bucket_name))
    }

    pub fn workdir(&self) -> Result<PathBuf> {
        let rel = self.opts.dir.strip_prefix(&self.opts.root).with_context(|| {
            format!("{} is not inside {}", self.opts.dir.display(), self.opts.root.display())
        })?;
        Ok(self.run_root().join(rel))
    }

    /// Copies `root` on first use; a later destroy reuses the copy and its state.
    fn prepare(&self) -> Result<PathBuf> {
        let workdir = self.workdir()?;
        let run_root = self.run_root();
        if !run_root.exists() {
            tracing::info!(from = %self.opts.root.display(), to = %run_root.display(), "copying provisioning tree");
            copy_tree(&self.opts.root, &run_root)?;
        }
        Ok(workdir)
    }

    fn program(&self) -> PathBuf {
        self.opts.binary.clone().unwrap_or_else(|| PathBuf::from(bin(self.opts.runner)))
    }

    fn spawn(&self, dir: &Path, args: &[String]) -> Result<Output> {
        Command::new(self.program())
            .args(args)
            .current_dir(dir)
            .envs(tool_env(self.opts.runner, &self.opts.vars, &self.opts.region))
            .output()
            .with_context(|| format!("spawn {} {}", self.program().display(), args[0]))
    }

    /// Runs one subcommand, retrying transient failures. Returns stdout.
    fn run(&self, args: &[String]) -> Result<String> {
        let dir = self.prepare()?;
        let step = args[0].as_str();
        let mut attempt = 0;
        loop {
            tracing::info!(step, dir = %dir.display(), attempt, "running provisioning tool");
            let out = self.spawn(&dir, args)?;
            let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
            for line in stdout.lines().chain(stderr.lines()) {
                tracing::debug!(step, "{line}");
            }
            if out.status.success() { return Ok(stdout); }

            let combined = format!("{stdout}\n{stderr}");
            match self.opts.retry.matching(&combined) {
                Some(re) if attempt < self.opts.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(step, pattern = re.as_str(), attempt, "retryable error, retrying");
                    std::thread::sleep(self.opts.retry.pause);
                }
                _ => anyhow::bail!("{step} failed in {} ({}): {}", dir.display(), out.status, last_lines(&stderr, 20)),
            }
        }
    }
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

impl Provisioner for Tool {
    fn init_and_apply(&self) -> Result<()> {
        self.run(&init_args())?;
        self.run(&apply_args(&self.opts.vars))?;
        Ok(())
    }

    fn outputs(&self) -> Result<OutputSet> {
        let raw = self.run(&output_args())?;
        let doc: Json = serde_json::from_str(raw.trim()).context("parse output -json")?;
        Ok(OutputSet::from_output_json(&doc))
    }

    fn destroy(&self) -> Result<()> {
        self.run(&destroy_args(&self.opts.vars))?;
        let run_root = self.run_root();
        if let Err(e) = std::fs::remove_dir_all(&run_root) {
            tracing::warn!(dir = %run_root.display(), error = %e, "could not remove working copy");
        }
        Ok(())
    }
}

/// Destroys what a [`Provisioner`] created once it goes out of scope.
///
/// Armed before apply so a half-applied stack is still torn down. Call
/// [`TeardownGuard::release`] to observe the destroy result; otherwise `Drop`
/// runs it and logs any failure.
pub struct TeardownGuard<'a, P: Provisioner> {
    provisioner: &'a P,
    done: bool,
}

impl<'a, P: Provisioner> TeardownGuard<'a, P> {
    pub fn arm(provisioner: &'a P) -> Self { Self { provisioner, done: false } }

    pub fn release(mut self) -> Result<()> {
        self.done = true;
        tracing::info!("tearing down provisioned resources");
        self.provisioner.destroy()
    }
}

impl<P: Provisioner> Drop for TeardownGuard<'_, P> {
    fn drop(&mut self) {
        if self.done { return; }
        self.done = true;
        tracing::info!("tearing down provisioned resources");
        if let Err(e) = self.provisioner.destroy() {
            tracing::error!(error = %format!("{e:#}"), "teardown failed");
        }
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() { anyhow::bail!("provisioning directory {} does not exist", dir.display()) }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketcheck_core::BucketName;
    use std::cell::{Cell, RefCell};

    fn vars() -> ProvisionVars { ProvisionVars::new(BucketName::parse("terratest-s3-abc").unwrap()) }

    #[test]
    fn lifecycle_args() {
        let a = apply_args(&vars());
        assert_eq!(&a[..2], ["apply", "-auto-approve"]);
        assert!(a.contains(&"bucket_name=terratest-s3-abc".to_string()));
        assert!(!a.iter().any(|f| f.starts_with("--terragrunt")));
        assert_eq!(init_args(), ["init", "-input=false", "-no-color"]);
        assert_eq!(destroy_args(&vars())[0], "destroy");
    }

    #[test]
    fn env_depends_on_runner() {
        let mut v = vars();
        v.environment = "staging".into();
        let has = |env: &[(String, String)], k: &str, val: &str| env.iter().any(|(a, b)| a == k && b == val);
        let tg = tool_env(Runner::Terragrunt, &v, "eu-west-1");
        let tg = &tg[..];
        assert!(has(tg, "TG_NON_INTERACTIVE", "true"));
        assert!(has(tg, "TG_VAR_environment", "staging"));
        assert!(has(tg, "AWS_REGION", "eu-west-1"));
        for r in [Runner::Terraform, Runner::Tofu] {
            assert!(has(&tool_env(r, &v, "eu-west-1")[..], "TF_VAR_environment", "staging"));
        }
    }

    #[test]
    fn default_retry_patterns() {
        let p = RetryPolicy::default();
        assert!(p.matching("Error: read tcp 1.2.3.4: read: connection reset by peer").is_some());
        assert!(p.matching("net/http: TLS handshake timeout").is_some());
        assert!(p.matching("Error installing provider \"aws\":\n dial tcp: i/o timeout").is_some());
        assert!(p.matching("Error: creating S3 Bucket: BucketAlreadyExists").is_none());
        assert!(RetryPolicy::none().matching("TLS handshake timeout").is_none());
    }

    #[test]
    fn last_lines_keeps_tail() {
        assert_eq!(last_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(last_lines("a", 5), "a");
    }

    #[derive(Default)]
    struct Fake { destroys: Cell<u32>, fail_destroy: bool, log: RefCell<Vec<&'static str>> }

    impl Provisioner for Fake {
        fn init_and_apply(&self) -> Result<()> { self.log.borrow_mut().push("apply"); Ok(()) }
        fn outputs(&self) -> Result<OutputSet> { Ok(OutputSet::default()) }
        fn destroy(&self) -> Result<()> {
            self.destroys.set(self.destroys.get() + 1);
            self.log.borrow_mut().push("destroy");
            if self.fail_destroy { anyhow::bail!("destroy failed") }
            Ok(())
        }
    }

    #[test]
    fn guard_destroys_once_on_release() {
        let fake = Fake::default();
        let guard = TeardownGuard::arm(&fake);
        fake.init_and_apply().unwrap();
        guard.release().unwrap();
        assert_eq!(fake.destroys.get(), 1);
        assert_eq!(*fake.log.borrow(), ["apply", "destroy"]);
    }

    #[test]
    fn guard_destroys_on_early_return() {
        let fake = Fake::default();
        let run = || -> Result<()> {
            let _guard = TeardownGuard::arm(&fake);
            anyhow::bail!("apply failed")
        };
        assert!(run().is_err());
        assert_eq!(fake.destroys.get(), 1);
    }

    #[test]
    fn failing_destroy_in_drop_does_not_panic() {
        let fake = Fake { fail_destroy: true, ..Default::default() };
        drop(TeardownGuard::arm(&fake));
        assert_eq!(fake.destroys.get(), 1);
        let fake = Fake { fail_destroy: true, ..Default::default() };
        assert!(TeardownGuard::arm(&fake).release().is_err());
        assert_eq!(fake.destroys.get(), 1);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// A unit under `live/unit` that sources `modules/bucket`, plus scratch
        /// space for the fake tool and its logs.
        struct Fixture { src: TempDir, work: TempDir, scratch: TempDir }

        impl Fixture {
            fn new() -> Self {
                let src = tempfile::tempdir().unwrap();
                std::fs::create_dir_all(src.path().join("modules/bucket")).unwrap();
                std::fs::write(src.path().join("modules/bucket/main.tf"), "# bucket\n").unwrap();
                std::fs::create_dir_all(src.path().join("live/unit/.terragrunt-cache")).unwrap();
                std::fs::write(src.path().join("live/unit/terragrunt.hcl"), "# unit\n").unwrap();
                std::fs::write(src.path().join("live/unit/.terragrunt-cache/terraform.tfstate"), "{}").unwrap();
                Self { src, work: tempfile::tempdir().unwrap(), scratch: tempfile::tempdir().unwrap() }
            }

            fn log(&self) -> PathBuf { self.scratch.path().join("calls.log") }

            fn read_log(&self) -> Vec<String> {
                std::fs::read_to_string(self.log()).unwrap().lines().map(str::to_string).collect()
            }

            // Stands in for terraform/terragrunt; LOG is replaced with the log path.
            fn script(&self, body: &str) -> PathBuf {
                let path = self.scratch.path().join("fake-tf");
                let body = body.replace("LOG", &self.log().display().to_string());
                std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path
            }

            fn tool(&self, runner: Runner, vars: ProvisionVars, binary: PathBuf, retry: RetryPolicy) -> Tool {
                Tool::new(ToolOptions {
                    runner,
                    binary: Some(binary),
                    root: self.src.path().to_path_buf(),
                    dir: self.src.path().join("live/unit"),
                    work_base: self.work.path().to_path_buf(),
                    region: "us-east-1".into(),
                    vars,
                    retry,
                })
            }
        }

        fn named(name: &str) -> ProvisionVars { ProvisionVars::new(BucketName::parse(name).unwrap()) }

        #[test]
        fn lifecycle_runs_in_private_copy_with_env() {
            let fx = Fixture::new();
            let bin = fx.script(r#"
echo "$1 $AWS_REGION $TG_VAR_environment $TG_NON_INTERACTIVE" >> LOG
test -f ../../modules/bucket/main.tf || exit 7
if [ "$1" = "output" ]; then
  echo '{"bucket_id":{"sensitive":false,"type":"string","value":"terratest-s3-abc"}}'
fi"#);
            let t = fx.tool(Runner::Terragrunt, vars(), bin, RetryPolicy::none());
            t.init_and_apply().unwrap();
            assert!(t.workdir().unwrap().join("terragrunt.hcl").is_file());
            assert!(!t.workdir().unwrap().join(".terragrunt-cache").exists());
            let outs = t.outputs().unwrap();
            t.destroy().unwrap();
            assert_eq!(outs.get("bucket_id").unwrap(), "terratest-s3-abc");
            assert_eq!(fx.read_log(), [
                "init us-east-1 test true", "apply us-east-1 test true",
                "output us-east-1 test true", "destroy us-east-1 test true",
            ]);
            assert!(!t.run_root().exists());
        }

        #[test]
        fn terraform_runner_receives_environment() {
            let fx = Fixture::new();
            let bin = fx.script(r#"echo "$1 $TF_VAR_environment" >> LOG"#);
            let mut vars = vars();
            vars.environment = "staging".into();
            fx.tool(Runner::Terraform, vars, bin, RetryPolicy::none()).init_and_apply().unwrap();
            assert_eq!(fx.read_log(), ["init staging", "apply staging"]);
        }

        #[test]
        fn buckets_get_separate_state_dirs() {
            let fx = Fixture::new();
            let bin = fx.script("pwd -P >> LOG; echo '{}' > terraform.tfstate");
            let a = fx.tool(Runner::Terraform, named("terratest-s3-aaaa"), bin.clone(), RetryPolicy::none());
            let b = fx.tool(Runner::Terraform, named("terratest-s3-bbbb"), bin, RetryPolicy::none());
            a.init_and_apply().unwrap();
            b.init_and_apply().unwrap();

            let dirs = fx.read_log();
            assert_eq!(dirs.len(), 4);
            let a_dir = std::fs::canonicalize(a.workdir().unwrap()).unwrap();
            let b_dir = std::fs::canonicalize(b.workdir().unwrap()).unwrap();
            assert_ne!(a_dir, b_dir);
            assert_eq!(PathBuf::from(&dirs[0]), a_dir);
            assert_eq!(PathBuf::from(&dirs[3]), b_dir);
            assert!(a_dir.join("terraform.tfstate").is_file());
            assert!(b_dir.join("terraform.tfstate").is_file());
            assert!(!fx.src.path().join("live/unit/terraform.tfstate").exists());
        }

        #[test]
        fn failed_destroy_keeps_working_copy() {
            let fx = Fixture::new();
            let bin = fx.script(r#"if [ "$1" = "destroy" ]; then echo 'Error: AccessDenied' >&2; exit 1; fi"#);
            let t = fx.tool(Runner::Terraform, vars(), bin, RetryPolicy::none());
            t.init_and_apply().unwrap();
            let err = t.destroy().unwrap_err();
            assert!(format!("{err:#}").contains("AccessDenied"));
            assert!(t.workdir().unwrap().is_dir());
        }

        #[test]
        fn dir_outside_root_is_rejected() {
            let fx = Fixture::new();
            let mut t = fx.tool(Runner::Terraform, vars(), fx.script("exit 0"), RetryPolicy::none());
            t.opts.dir = fx.scratch.path().to_path_buf();
            assert!(t.init_and_apply().is_err());
        }

        #[test]
        fn retryable_failures_are_retried_until_limit() {
            let fx = Fixture::new();
            let bin = fx.script("echo x >> LOG; echo 'TLS handshake timeout' >&2; exit 1");
            let retry = RetryPolicy { max_retries: 2, pause: Duration::ZERO, ..RetryPolicy::default() };
            assert!(fx.tool(Runner::Terraform, vars(), bin, retry).destroy().is_err());
            assert_eq!(fx.read_log().len(), 3);
        }
    }
}
