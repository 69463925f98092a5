//! Provisioner configuration.
//!
//! Everything is read from `TRAINVM_*` environment variables with defaults
//! suitable for a single-process deployment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use trainvm_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::backend::{ElasticTemplate, InstanceTtl, DEFAULT_PROBE_PORT, DEFAULT_STATIC_POOL};
use crate::cleanup::ExpiryPolicy;

/// Which intake paths this process serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntegrationMode {
    /// Platform sessions only.
    Platform,
    /// Promise broker only.
    Broker,
    /// Both paths.
    #[default]
    Hybrid,
}

impl IntegrationMode {
    pub fn runs_platform(self) -> bool {
        matches!(self, Self::Platform | Self::Hybrid)
    }

    pub fn runs_broker(self) -> bool {
        matches!(self, Self::Broker | Self::Hybrid)
    }
}

impl FromStr for IntegrationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "platform" | "hobbyfarm-only" => Ok(Self::Platform),
            "broker" | "kratix-only" => Ok(Self::Broker),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(other.to_string()),
        }
    }
}

/// Provisioner configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub integration_mode: IntegrationMode,

    /// Unrecognized integration mode value, reported once logging is up.
    pub unknown_integration_mode: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub reconcile_interval: Duration,
    pub cleanup_interval: Duration,
    pub expiry: ExpiryPolicy,

    /// Static machine addresses, in allocation order.
    pub static_pool: Vec<String>,
    pub probe_port: u16,

    /// Declarative store base URL.
    pub store_url: String,
    pub store_token: Option<String>,

    pub request_namespace: String,
    pub platform_namespace: String,

    /// Secret name projected onto platform machines.
    pub ssh_secret_name: String,

    pub provision_command: String,
    pub job_dir: PathBuf,

    /// `None` disables the elastic fallback for every request.
    pub elastic: Option<ElasticTemplate>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            let value: u64 = lookup(key)
                .map(|v| v.parse())
                .transpose()
                .with_context(|| format!("{key} must be an integer (seconds)."))?
                .unwrap_or(default);
            Ok(Duration::from_secs(value.max(1)))
        };

        let (integration_mode, unknown_integration_mode) =
            match lookup("TRAINVM_INTEGRATION_MODE") {
                Some(raw) => match raw.parse() {
                    Ok(mode) => (mode, None),
                    Err(unknown) => (IntegrationMode::Hybrid, Some(unknown)),
                },
                None => (IntegrationMode::Hybrid, None),
            };

        let static_pool = match lookup("TRAINVM_STATIC_POOL") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_STATIC_POOL.iter().map(|s| s.to_string()).collect(),
        };

        let probe_port: u16 = lookup("TRAINVM_PROBE_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("TRAINVM_PROBE_PORT must be a port number.")?
            .unwrap_or(DEFAULT_PROBE_PORT);

        let defaults = ExpiryPolicy::default();
        let expiry = ExpiryPolicy {
            allocation_timeout: secs(
                "TRAINVM_ALLOCATION_TIMEOUT_SECS",
                defaults.allocation_timeout.as_secs(),
            )?,
            tracking_ttl: secs("TRAINVM_TRACKING_TTL_SECS", defaults.tracking_ttl.as_secs())?,
            instance_ttl: InstanceTtl::default(),
        };

        let elastic_enabled = lookup("TRAINVM_ELASTIC_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);
        let elastic = elastic_enabled.then(|| {
            let base = ElasticTemplate::default();
            ElasticTemplate {
                image: lookup("TRAINVM_ELASTIC_IMAGE").unwrap_or(base.image),
                instance_type: lookup("TRAINVM_ELASTIC_INSTANCE_TYPE").unwrap_or(base.instance_type),
                region: lookup("TRAINVM_ELASTIC_REGION").unwrap_or(base.region),
                subnet_id: lookup("TRAINVM_ELASTIC_SUBNET_ID").or(base.subnet_id),
                security_group_ids: lookup("TRAINVM_ELASTIC_SECURITY_GROUP_IDS")
                    .map(|v| {
                        v.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or(base.security_group_ids),
                key_name: lookup("TRAINVM_ELASTIC_KEY_NAME").or(base.key_name),
                associate_public_ip: base.associate_public_ip,
                provider_config: lookup("TRAINVM_ELASTIC_PROVIDER_CONFIG")
                    .unwrap_or(base.provider_config),
                tags: base.tags,
            }
        });

        Ok(Self {
            integration_mode,
            unknown_integration_mode,
            log_level: var("TRAINVM_LOG_LEVEL", "info"),
            reconcile_interval: secs(
                "TRAINVM_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL.as_secs(),
            )?,
            cleanup_interval: secs("TRAINVM_CLEANUP_INTERVAL_SECS", 60)?,
            expiry,
            static_pool,
            probe_port,
            store_url: var("TRAINVM_STORE_URL", "http://127.0.0.1:8001"),
            store_token: lookup("TRAINVM_STORE_TOKEN").filter(|t| !t.is_empty()),
            request_namespace: var("TRAINVM_REQUEST_NAMESPACE", "default"),
            platform_namespace: var("TRAINVM_PLATFORM_NAMESPACE", "hobbyfarm-system"),
            ssh_secret_name: var("TRAINVM_SSH_SECRET_NAME", "training-ssh-key"),
            provision_command: var("TRAINVM_PROVISION_COMMAND", "ansible-playbook"),
            job_dir: PathBuf::from(var("TRAINVM_JOB_DIR", "playbooks")),
            elastic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.integration_mode, IntegrationMode::Hybrid);
        assert_eq!(config.static_pool, vec!["192.168.2.37", "192.168.2.38"]);
        assert_eq!(config.probe_port, 22);
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.expiry.allocation_timeout, Duration::from_secs(3600));
        assert_eq!(config.expiry.tracking_ttl, Duration::from_secs(86400));
        assert!(config.elastic.is_some());
        assert!(config.store_token.is_none());
    }

    #[rstest]
    #[case("platform", IntegrationMode::Platform)]
    #[case("hobbyfarm-only", IntegrationMode::Platform)]
    #[case("broker", IntegrationMode::Broker)]
    #[case("kratix-only", IntegrationMode::Broker)]
    #[case("HYBRID", IntegrationMode::Hybrid)]
    fn test_integration_modes(#[case] raw: &str, #[case] expected: IntegrationMode) {
        let config = load(&[("TRAINVM_INTEGRATION_MODE", raw)]).unwrap();
        assert_eq!(config.integration_mode, expected);
        assert!(config.unknown_integration_mode.is_none());
    }

    #[test]
    fn test_unknown_mode_falls_back_to_hybrid() {
        let config = load(&[("TRAINVM_INTEGRATION_MODE", "everything")]).unwrap();

        assert_eq!(config.integration_mode, IntegrationMode::Hybrid);
        assert_eq!(config.unknown_integration_mode.as_deref(), Some("everything"));
    }

    #[test]
    fn test_pool_and_elastic_overrides() {
        let config = load(&[
            ("TRAINVM_STATIC_POOL", "10.0.0.1, 10.0.0.2,,"),
            ("TRAINVM_ELASTIC_ENABLED", "false"),
        ])
        .unwrap();

        assert_eq!(config.static_pool, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(config.elastic.is_none());
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let err = load(&[("TRAINVM_RECONCILE_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("TRAINVM_RECONCILE_INTERVAL_SECS"));
    }
}
