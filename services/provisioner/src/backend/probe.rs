//! Liveness probes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::debug;

use super::ProbePolicy;

/// Administrative port probed on training machines.
pub const DEFAULT_PROBE_PORT: u16 = 22;

/// Connectivity check against a machine address.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns true if `address` accepted a connection within the policy.
    async fn probe(&self, address: &str, policy: &ProbePolicy) -> bool;
}

/// Probes by opening a TCP connection to the administrative port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PORT)
    }
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Socket target for an address. An address that already names a port
    /// is used as-is.
    pub fn target(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if let Some((host, port)) = address.rsplit_once(':') {
            if !host.contains(':') && port.parse::<u16>().is_ok() {
                return address.to_string();
            }
        }
        if address.contains(':') {
            return format!("[{}]:{}", address, self.port);
        }
        format!("{}:{}", address, self.port)
    }

    /// One connection attempt.
    pub async fn connect_once(&self, address: &str, timeout: std::time::Duration) -> bool {
        let target = self.target(address);
        match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "Probe connection refused");
                false
            }
            Err(_) => {
                debug!(target = %target, timeout_secs = timeout.as_secs(), "Probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self, address: &str, policy: &ProbePolicy) -> bool {
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            if self.connect_once(address, policy.connect_timeout).await {
                return true;
            }
            if attempt < attempts && !policy.sleep_between.is_zero() {
                tokio::time::sleep(policy.sleep_between).await;
            }
        }
        false
    }
}

/// Probe double whose answers are set by the caller.
///
/// Unknown addresses answer with the default set at construction.
pub struct MockProbe {
    default_live: AtomicBool,
    overrides: RwLock<BTreeMap<String, bool>>,
}

impl MockProbe {
    /// Every address is down until marked live.
    pub fn new() -> Self {
        Self {
            default_live: AtomicBool::new(false),
            overrides: RwLock::new(BTreeMap::new()),
        }
    }

    /// Every address is live until marked down.
    pub fn all_live() -> Self {
        Self {
            default_live: AtomicBool::new(true),
            overrides: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn set_live(&self, address: &str, live: bool) {
        self.overrides.write().await.insert(address.to_string(), live);
    }

    pub fn set_default(&self, live: bool) {
        self.default_live.store(live, Ordering::SeqCst);
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for MockProbe {
    async fn probe(&self, address: &str, _policy: &ProbePolicy) -> bool {
        let overrides = self.overrides.read().await;
        let live = overrides
            .get(address)
            .copied()
            .unwrap_or_else(|| self.default_live.load(Ordering::SeqCst));
        debug!(address = %address, live, "[MOCK] Probe");
        live
    }
}
