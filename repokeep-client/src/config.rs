use std::time::Duration;
use shared::protocol::{self, ADDR_ENV, DEFAULT_PORT};

/// Knobs for the bootstrap procedure.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit service address; skips the registry lookup when set.
    pub address: Option<String>,
    /// Port assumed for a freshly spawned service that has not registered yet.
    pub default_port: u16,
    /// Upper bound for a single health call.
    pub probe_timeout: Duration,
    /// Ready-wait budget after a spawn.
    pub ready_attempts: u32,
    pub ready_delay: Duration,
    /// Per-request timeout for ordinary calls on the channel.
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            default_port: DEFAULT_PORT,
            probe_timeout: Duration::from_secs(2),
            ready_attempts: 50,
            ready_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Defaults, with the address taken from `REPOKEEP_ADDR` when set.
    pub fn from_env() -> Self {
        let address = std::env::var(ADDR_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn default_address(&self) -> String {
        protocol::local_address(self.default_port)
    }

    /// Port of the address override, which a spawned service must listen on.
    pub fn override_port(&self) -> Option<u16> {
        let address = self.address.as_deref()?;
        address.rsplit_once(':')?.1.parse().ok()
    }
}
