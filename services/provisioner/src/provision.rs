//! Machine configuration.
//!
//! The reconciler hands a reachable machine to a [`Provisioner`] with a
//! [`ConfigBundle`] picked by a [`ConfigResolver`]. Both are opaque to the
//! reconciler: it only looks at whether they succeeded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{TcpProbe, DEFAULT_PROBE_PORT};

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{address} not reachable within {timeout:?}")]
    NotReady { address: String, timeout: Duration },

    #[error("job {job} exited with {code:?}: {stderr}")]
    JobFailed {
        job: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("config resolution failed: {0}")]
    Resolve(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where and as whom to configure a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub address: String,
    pub ssh_username: String,
}

/// Configuration applied to a machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigBundle {
    /// Configuration jobs, run in order.
    pub jobs: Vec<String>,
    pub packages: Vec<String>,
    pub requirements: Vec<String>,
    pub variables: BTreeMap<String, Value>,
}

impl Default for ConfigBundle {
    fn default() -> Self {
        Self {
            jobs: vec!["base.yaml".to_string(), "dynamic.yaml".to_string()],
            packages: Vec::new(),
            requirements: Vec::new(),
            variables: BTreeMap::new(),
        }
    }
}

/// Picks the configuration for a session.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, session_id: &str) -> Result<ConfigBundle, ProvisionError>;
}

/// Resolver that always answers with the default bundle.
#[derive(Debug, Clone, Default)]
pub struct DefaultConfigResolver;

#[async_trait]
impl ConfigResolver for DefaultConfigResolver {
    async fn resolve(&self, _session_id: &str) -> Result<ConfigBundle, ProvisionError> {
        Ok(ConfigBundle::default())
    }
}

/// Resolve a bundle, falling back to the default one on error.
pub async fn resolve_or_default(resolver: &dyn ConfigResolver, session_id: &str) -> ConfigBundle {
    match resolver.resolve(session_id).await {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(session = %session_id, error = %e, "Config resolution failed, using default bundle");
            ConfigBundle::default()
        }
    }
}

/// Configures reachable machines.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Wait until the machine accepts administrative connections.
    async fn wait_for_ready(
        &self,
        target: &ProvisionTarget,
        timeout: Duration,
    ) -> Result<(), ProvisionError>;

    /// Apply a configuration bundle.
    async fn run_configuration(
        &self,
        target: &ProvisionTarget,
        session_id: &str,
        scenario: &str,
        bundle: &ConfigBundle,
    ) -> Result<(), ProvisionError>;
}

/// Provisioner running an external configuration command per job.
///
/// Each job is invoked as
/// `<command> -i <address>, -u <user> --extra-vars <json> <job_dir>/<job>`.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
    job_dir: PathBuf,
    probe: TcpProbe,
    poll_interval: Duration,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>, job_dir: impl Into<PathBuf>, probe_port: u16) -> Self {
        Self {
            command: command.into(),
            job_dir: job_dir.into(),
            probe: TcpProbe::new(probe_port),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn extra_vars(
        target: &ProvisionTarget,
        session_id: &str,
        scenario: &str,
        bundle: &ConfigBundle,
    ) -> Value {
        let mut vars = serde_json::Map::new();
        for (k, v) in &bundle.variables {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert("session_id".into(), Value::from(session_id));
        vars.insert("scenario".into(), Value::from(scenario));
        vars.insert("ansible_user".into(), Value::from(target.ssh_username.as_str()));
        vars.insert("packages".into(), Value::from(bundle.packages.clone()));
        vars.insert("requirements".into(), Value::from(bundle.requirements.clone()));
        Value::Object(vars)
    }
}

impl Default for CommandProvisioner {
    fn default() -> Self {
        Self::new("ansible-playbook", "playbooks", DEFAULT_PROBE_PORT)
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn wait_for_ready(
        &self,
        target: &ProvisionTarget,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProvisionError::NotReady {
                    address: target.address.clone(),
                    timeout,
                });
            }
            let attempt = remaining.min(self.poll_interval);
            if self.probe.connect_once(&target.address, attempt).await {
                debug!(address = %target.address, "Machine accepting connections");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    async fn run_configuration(
        &self,
        target: &ProvisionTarget,
        session_id: &str,
        scenario: &str,
        bundle: &ConfigBundle,
    ) -> Result<(), ProvisionError> {
        let extra_vars = serde_json::to_string(&Self::extra_vars(target, session_id, scenario, bundle))?;

        for job in &bundle.jobs {
            info!(address = %target.address, session = %session_id, job = %job, "Running configuration job");
            let output = Command::new(&self.command)
                .arg("-i")
                .arg(format!("{},", target.address))
                .arg("-u")
                .arg(&target.ssh_username)
                .arg("--extra-vars")
                .arg(&extra_vars)
                .arg(self.job_dir.join(job))
                .kill_on_drop(true)
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(ProvisionError::JobFailed {
                    job: job.clone(),
                    code: output.status.code(),
                    stderr,
                });
            }
        }

        Ok(())
    }
}

/// Provisioner double recording calls.
pub struct MockProvisioner {
    fail_ready: AtomicBool,
    fail_configuration: AtomicBool,
    ready_calls: AtomicU32,
    configuration_calls: AtomicU32,
    configuration_delay: Duration,
}

impl MockProvisioner {
    /// Create a mock provisioner where everything succeeds.
    pub fn new() -> Self {
        Self {
            fail_ready: AtomicBool::new(false),
            fail_configuration: AtomicBool::new(false),
            ready_calls: AtomicU32::new(0),
            configuration_calls: AtomicU32::new(0),
            configuration_delay: Duration::ZERO,
        }
    }

    /// Make every configuration run take `delay`.
    pub fn with_configuration_delay(mut self, delay: Duration) -> Self {
        self.configuration_delay = delay;
        self
    }

    /// Create a mock provisioner whose configuration runs fail.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.set_fail_configuration(true);
        mock
    }

    pub fn set_fail_ready(&self, fail: bool) {
        self.fail_ready.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_configuration(&self, fail: bool) {
        self.fail_configuration.store(fail, Ordering::SeqCst);
    }

    pub fn ready_calls(&self) -> u32 {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn configuration_calls(&self) -> u32 {
        self.configuration_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn wait_for_ready(
        &self,
        target: &ProvisionTarget,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ready.load(Ordering::SeqCst) {
            return Err(ProvisionError::NotReady {
                address: target.address.clone(),
                timeout,
            });
        }
        Ok(())
    }

    async fn run_configuration(
        &self,
        target: &ProvisionTarget,
        session_id: &str,
        _scenario: &str,
        bundle: &ConfigBundle,
    ) -> Result<(), ProvisionError> {
        self.configuration_calls.fetch_add(1, Ordering::SeqCst);
        if !self.configuration_delay.is_zero() {
            tokio::time::sleep(self.configuration_delay).await;
        }
        debug!(address = %target.address, session = %session_id, jobs = bundle.jobs.len(), "[MOCK] Configuring machine");
        if self.fail_configuration.load(Ordering::SeqCst) {
            return Err(ProvisionError::JobFailed {
                job: bundle.jobs.first().cloned().unwrap_or_default(),
                code: Some(2),
                stderr: "mock provisioner configured to fail".to_string(),
            });
        }
        Ok(())
    }
}
