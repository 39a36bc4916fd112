use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use repokeep_client::ServiceChannel;
use shared::registry::{Discovery, ServiceRegistry};
use shared::types::{HealthStatus, ServiceDescriptor};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{pipeline, routes};
use crate::config::Config;
use crate::idle::{IdleMonitor, IdleTracker};
use crate::rotation::{ProfileKeyLedger, RotationScheduler, RotationSweep};
use crate::store::db::RecordDb;
use crate::store::RecordStore;
use crate::store_manager::StoreHandle;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of the service process: staleness pass, bind, register, serve,
/// then ordered teardown once any shutdown trigger fires.
pub struct Service {
    config: Config,
    registry: ServiceRegistry,
}

/// A service that owns its port and has published its registry entry.
pub struct BoundService {
    config: Config,
    registry: ServiceRegistry,
    listener: TcpListener,
    descriptor: ServiceDescriptor,
    store: StoreHandle,
}

impl Service {
    pub fn new(config: Config, registry: ServiceRegistry) -> Self {
        Self { config, registry }
    }

    /// Serve until Ctrl-C, SIGTERM, the idle monitor or a shutdown call.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve(shutdown_signal()).await
    }

    pub async fn bind(self) -> Result<BoundService> {
        let pid = i64::from(std::process::id());

        match self.registry.discover() {
            Discovery::Running(existing) if existing.pid != pid => {
                if is_serving(&existing.address).await {
                    warn!(
                        "Service already running as pid {} at {}, refusing to start",
                        existing.pid, existing.address
                    );
                    bail!(
                        "another instance is already running (pid {}, {})",
                        existing.pid,
                        existing.address
                    );
                }
                // Live pid but nothing answering: a reused pid, not a service
                info!("Registry pid {} does not answer at {}, replacing entry", existing.pid, existing.address);
            }
            _ => {}
        }

        let db = RecordDb::open(&self.config.store.db_path)?;
        info!("Opened database at {:?}", self.config.store.db_path);

        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.service.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}; is another instance using the port?", addr))?;
        let port = listener.local_addr().context("Failed to read bound address")?.port();

        let descriptor = self
            .registry
            .write(port)
            .with_context(|| format!("Failed to write registry entry {}", self.registry.path().display()))?;
        info!("Listening on 127.0.0.1:{} (pid {})", port, descriptor.pid);

        Ok(BoundService {
            config: self.config,
            registry: self.registry,
            listener,
            descriptor,
            store: StoreHandle::spawn(db),
        })
    }
}

impl BoundService {
    #[cfg(test)]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Serve until `stop` resolves or the service asks to stop itself, then
    /// tear everything down.
    pub async fn serve<F>(self, stop: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let BoundService {
            config,
            registry,
            listener,
            descriptor,
            store,
        } = self;

        let store_dyn: Arc<dyn RecordStore> = Arc::new(store.clone());
        let shutdown = CancellationToken::new();

        let tracker = Arc::new(IdleTracker::new(config.service.idle_timeout()));
        let idle_monitor = IdleMonitor::new(Arc::clone(&tracker), config.service.idle_check_interval());

        let rotation = if config.rotation.enabled {
            let ledger = Arc::new(ProfileKeyLedger::new(Arc::clone(&store_dyn)));
            Some(RotationScheduler::new(RotationSweep::new(ledger, &config.rotation)))
        } else {
            debug!("Key rotation disabled");
            None
        };

        let state = routes::AppState {
            store: store_dyn,
            shutdown: shutdown.clone(),
            pid: descriptor.pid,
            started_at: descriptor.started_at,
        };
        let app = pipeline::attach(
            routes::router(state),
            Some(Arc::clone(&tracker)),
            config.service.request_timeout(),
        );

        idle_monitor.start();
        if let Some(rotation) = &rotation {
            rotation.start();
        }

        let idle_signal = tracker.shutdown_signal();
        let trigger = shutdown.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = stop => info!("Shutdown signal received"),
                    _ = idle_signal.cancelled() => info!("Idle timeout reached"),
                    _ = trigger.cancelled() => {}
                }
                // Health answers not-serving from here on
                trigger.cancel();
            })
            .await;

        info!("Shutting down");
        idle_monitor.stop().await;
        if let Some(rotation) = &rotation {
            rotation.stop().await;
        }

        if let Err(e) = store.shutdown().await {
            error!("Failed to shut down store: {:#}", e);
        }

        // Cleanup failures are logged inside and deliberately not returned:
        // nothing can act on them this late, and a half-finished shutdown is worse.
        registry.remove_if_owned(descriptor.pid);

        info!("Shutdown complete");
        result.context("Server error")
    }
}

async fn is_serving(address: &str) -> bool {
    match ServiceChannel::new(address, PROBE_TIMEOUT, PROBE_TIMEOUT) {
        Ok(channel) => channel.health().await == HealthStatus::Serving,
        Err(e) => {
            warn!("Failed to probe {}: {}", address, e);
            false
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::liveness::ProcessIdentity;
    use shared::types::{CallCode, RecordKind};
    use repokeep_client::CallError;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.service.port = 0;
        config.store.db_path = dir.join("records.db");
        config
    }

    fn channel(descriptor: &ServiceDescriptor) -> ServiceChannel {
        let address = format!("127.0.0.1:{}", descriptor.port);
        ServiceChannel::new(address, Duration::from_secs(5), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_serves_then_shuts_down_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());

        let bound = Service::new(config(dir.path()), registry.clone()).bind().await.unwrap();
        let descriptor = bound.descriptor().clone();
        assert_eq!(registry.read().unwrap(), Some(descriptor.clone()));
        assert_eq!(descriptor.pid, i64::from(std::process::id()));

        let server = tokio::spawn(bound.serve(std::future::pending()));
        let channel = channel(&descriptor);

        assert_eq!(channel.health().await, HealthStatus::Serving);
        channel
            .put_record(RecordKind::Workspace, "main", &json!({"path": "/src"}))
            .await
            .unwrap();
        assert_eq!(channel.list_records(RecordKind::Workspace).await.unwrap().len(), 1);

        channel.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(registry.read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_idle_service_stops_itself() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        let mut config = config(dir.path());
        config.service.idle_timeout_secs = 1;
        config.service.idle_check_interval_secs = 1;

        let bound = Service::new(config, registry.clone()).bind().await.unwrap();
        let server = tokio::spawn(bound.serve(std::future::pending()));

        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("idle service kept running")
            .unwrap()
            .unwrap();
        assert_eq!(registry.read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_entry_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        registry
            .write_descriptor(&ServiceDescriptor {
                address: "localhost:1".to_string(),
                port: 1,
                pid: 999_999_999,
                started_at: chrono::Utc::now(),
            })
            .unwrap();

        let bound = Service::new(config(dir.path()), registry.clone()).bind().await.unwrap();
        let current = registry.read().unwrap().unwrap();
        assert_eq!(current.pid, i64::from(std::process::id()));
        assert_ne!(current.port, 1);

        bound.serve(async {}).await.unwrap();
    }

    /// A live process under the test identity, killed on drop.
    #[cfg(unix)]
    struct Sleeper(std::process::Child);

    #[cfg(unix)]
    impl Sleeper {
        fn spawn() -> Self {
            Self(std::process::Command::new("sleep").arg("30").spawn().unwrap())
        }

        fn pid(&self) -> i64 {
            i64::from(self.0.id())
        }
    }

    #[cfg(unix)]
    impl Drop for Sleeper {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refuses_to_start_beside_serving_instance() {
        let dir = tempfile::tempdir().unwrap();
        let first = Service::new(config(dir.path()), ServiceRegistry::in_dir(dir.path()))
            .bind()
            .await
            .unwrap();
        let first_port = first.descriptor().port;
        tokio::spawn(first.serve(std::future::pending()));

        // Pretend the serving instance is another live process
        let other = Sleeper::spawn();
        let other_dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(other_dir.path()).with_identity(ProcessIdentity::new("sleep"));
        let entry = ServiceDescriptor {
            address: format!("127.0.0.1:{}", first_port),
            port: first_port,
            pid: other.pid(),
            started_at: chrono::Utc::now(),
        };
        registry.write_descriptor(&entry).unwrap();

        let result = Service::new(config(other_dir.path()), registry.clone()).bind().await;
        let err = result.err().expect("second instance started");
        assert!(err.to_string().contains("already running"));
        assert_eq!(registry.read().unwrap(), Some(entry));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_pid_without_service_is_replaced() {
        let other = Sleeper::spawn();
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path()).with_identity(ProcessIdentity::new("sleep"));
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        registry
            .write_descriptor(&ServiceDescriptor {
                address: unused.to_string(),
                port: unused.port(),
                pid: other.pid(),
                started_at: chrono::Utc::now(),
            })
            .unwrap();

        let bound = Service::new(config(dir.path()), registry.clone()).bind().await.unwrap();
        assert_eq!(registry.read().unwrap().unwrap().pid, i64::from(std::process::id()));
        bound.serve(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_caller_deadline_is_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let bound = Service::new(config(dir.path()), ServiceRegistry::in_dir(dir.path()))
            .bind()
            .await
            .unwrap();
        let descriptor = bound.descriptor().clone();
        tokio::spawn(bound.serve(std::future::pending()));

        let err = channel(&descriptor)
            .with_deadline(Duration::ZERO)
            .list_records(RecordKind::Profile)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Remote { code: CallCode::Canceled, .. }), "got {err:?}");
    }
}
