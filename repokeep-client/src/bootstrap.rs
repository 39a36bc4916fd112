use std::sync::{Arc, Mutex};
use shared::registry::{Discovery, ServiceRegistry};
use shared::types::HealthStatus;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::channel::{CallError, ServiceChannel};
use crate::config::ClientConfig;
use crate::launcher::Launcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Probing,
    Spawning,
    WaitingReady,
    Serving,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to start on-demand service: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("service started but not ready at {address} after {attempts} attempts")]
    NotReady { address: String, attempts: u32 },

    #[error(transparent)]
    Channel(#[from] CallError),
}

/// Finds a serving instance or spawns one. The channel is cached for the
/// lifetime of the handle.
pub struct Bootstrap {
    config: ClientConfig,
    registry: ServiceRegistry,
    launcher: Arc<dyn Launcher>,
    channel: OnceCell<ServiceChannel>,
    transitions: Mutex<Vec<BootstrapState>>,
}

impl Bootstrap {
    pub fn new(config: ClientConfig, registry: ServiceRegistry, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            registry,
            launcher,
            channel: OnceCell::new(),
            transitions: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// States entered so far, in order.
    pub fn transitions(&self) -> Vec<BootstrapState> {
        self.transitions.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// The cached channel, if a previous `connect` succeeded.
    pub fn cached(&self) -> Option<&ServiceChannel> {
        self.channel.get()
    }

    /// Return a ready channel, starting the service if none is reachable.
    /// Concurrent callers share one attempt; a failed attempt is not cached.
    pub async fn connect(&self) -> Result<&ServiceChannel, BootstrapError> {
        self.channel.get_or_try_init(|| self.establish()).await
    }

    /// Like `connect`, but never spawns. Returns `None` when no serving
    /// instance is found.
    pub async fn probe_only(&self) -> Result<Option<ServiceChannel>, BootstrapError> {
        if let Some(channel) = self.channel.get() {
            return Ok(Some(channel.clone()));
        }
        self.probe().await
    }

    fn enter(&self, state: BootstrapState) {
        trace!("Bootstrap state -> {:?}", state);
        if let Ok(mut transitions) = self.transitions.lock() {
            transitions.push(state);
        }
    }

    async fn establish(&self) -> Result<ServiceChannel, BootstrapError> {
        self.enter(BootstrapState::Probing);
        match self.probe().await {
            Ok(Some(channel)) => {
                debug!("Found serving instance at {}", channel.address());
                self.enter(BootstrapState::Serving);
                return Ok(channel);
            }
            Ok(None) => {}
            Err(e) => {
                self.enter(BootstrapState::Failed);
                return Err(e);
            }
        }

        self.enter(BootstrapState::Spawning);
        let pid = match self.launcher.launch(self.config.override_port()) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Failed to launch service: {}", e);
                self.enter(BootstrapState::Failed);
                return Err(BootstrapError::SpawnFailed(e));
            }
        };
        info!("Started on-demand service (pid {})", pid);

        self.enter(BootstrapState::WaitingReady);
        match self.wait_ready().await {
            Ok(channel) => {
                self.enter(BootstrapState::Serving);
                Ok(channel)
            }
            Err(e) => {
                self.enter(BootstrapState::Failed);
                Err(e)
            }
        }
    }

    fn channel_for(&self, address: &str) -> Result<ServiceChannel, BootstrapError> {
        Ok(ServiceChannel::new(address, self.config.call_timeout, self.config.probe_timeout)?)
    }

    /// One bounded health call against the last-known address. `None` means
    /// spawn: no live registry entry, unreachable, or not serving.
    async fn probe(&self) -> Result<Option<ServiceChannel>, BootstrapError> {
        let address = match &self.config.address {
            Some(address) => address.clone(),
            None => match self.registry.discover() {
                Discovery::Running(descriptor) => descriptor.address,
                Discovery::NotRunning => {
                    debug!("No live registry entry at {}", self.registry.path().display());
                    return Ok(None);
                }
            },
        };

        let channel = self.channel_for(&address)?;
        match channel.health().await {
            HealthStatus::Serving => Ok(Some(channel)),
            status => {
                debug!("Health probe at {} returned {:?}", address, status);
                Ok(None)
            }
        }
    }

    /// Where a freshly spawned service should be found. The registry entry
    /// wins once the service has written it.
    fn ready_address(&self) -> String {
        if let Some(address) = &self.config.address {
            return address.clone();
        }
        match self.registry.read() {
            Ok(Some(descriptor)) => descriptor.address,
            _ => self.config.default_address(),
        }
    }

    async fn wait_ready(&self) -> Result<ServiceChannel, BootstrapError> {
        let attempts = self.config.ready_attempts;
        let mut address = self.ready_address();

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.ready_delay).await;

            address = self.ready_address();
            let channel = self.channel_for(&address)?;
            match channel.health().await {
                HealthStatus::Serving => {
                    debug!("Service ready at {} after {} attempts", address, attempt);
                    return Ok(channel);
                }
                status => trace!("Attempt {}: {} is {:?}", attempt, address, status),
            }
        }

        Err(BootstrapError::NotReady { address, attempts })
    }
}
