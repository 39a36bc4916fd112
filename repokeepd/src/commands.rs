use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use repokeep_client::{Bootstrap, ClientConfig, ExecutableLauncher, ServiceChannel};
use serde::Serialize;
use shared::protocol::{self, SERVICE_LOG_FILE};
use shared::registry::ServiceRegistry;

use crate::cli::{RecordsCmd, ServiceCmd};
use crate::config::Config;
use crate::service::Service;

/// Idle timeout handed to a service spawned on demand.
const ON_DEMAND_IDLE_SECS: u64 = 900;

const STOP_POLL_ATTEMPTS: u32 = 50;
const STOP_POLL_DELAY: Duration = Duration::from_millis(100);

pub async fn service(action: ServiceCmd) -> Result<ExitCode> {
    match action {
        ServiceCmd::Run { config, port, idle_timeout } => {
            run(config, port, idle_timeout).await?;
            Ok(ExitCode::SUCCESS)
        }
        ServiceCmd::Start => {
            let bootstrap = bootstrap()?;
            let channel = bootstrap.connect().await?;
            print_status(channel).await?;
            Ok(ExitCode::SUCCESS)
        }
        ServiceCmd::Status => {
            let bootstrap = bootstrap()?;
            match bootstrap.probe_only().await? {
                Some(channel) => {
                    print_status(&channel).await?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("not running");
                    Ok(ExitCode::from(1))
                }
            }
        }
        ServiceCmd::Stop => {
            let bootstrap = bootstrap()?;
            let Some(channel) = bootstrap.probe_only().await? else {
                println!("not running");
                return Ok(ExitCode::SUCCESS);
            };
            channel.shutdown().await?;
            wait_for_exit(bootstrap.registry()).await;
            println!("stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Each call carries a caller deadline of `timeout` from when it is sent.
pub async fn records(action: RecordsCmd, timeout: Duration) -> Result<ExitCode> {
    let bootstrap = bootstrap()?;
    let channel = bootstrap.connect().await?.with_deadline(timeout);

    match action {
        RecordsCmd::List { kind } => {
            for record in channel.list_records(kind).await? {
                println!("{}", record.name);
            }
        }
        RecordsCmd::Get { kind, name } => {
            print_json(&channel.get_record(kind, &name).await?)?;
        }
        RecordsCmd::Put { kind, name, data } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("Record data must be a JSON document")?;
            print_json(&channel.put_record(kind, &name, &data).await?)?;
        }
        RecordsCmd::Delete { kind, name } => {
            channel.delete_record(kind, &name).await?;
            println!("deleted {} {}", kind, name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(config: Option<PathBuf>, port: Option<u16>, idle_timeout: Option<u64>) -> Result<()> {
    let mut config = Config::load_or_default(config.as_deref())?;
    if let Some(port) = port {
        config.service.port = port;
    }
    if let Some(secs) = idle_timeout {
        config.service.idle_timeout_secs = secs;
    }

    let registry = ServiceRegistry::default_location()?;
    tracing::info!("Registry at {}", registry.path().display());
    Service::new(config, registry).run().await
}

/// Client bootstrap that respawns this same executable as the service.
fn bootstrap() -> Result<Bootstrap> {
    let registry = ServiceRegistry::default_location()?;

    let mut launcher = ExecutableLauncher::current_exe()
        .context("Failed to locate the running executable")?
        .args(["service", "run", "--idle-timeout"])
        .arg(ON_DEMAND_IDLE_SECS.to_string());
    if let Some(dir) = protocol::state_dir() {
        launcher = launcher.log_to(dir.join(SERVICE_LOG_FILE));
    }

    Ok(Bootstrap::new(ClientConfig::from_env(), registry, Arc::new(launcher)))
}

async fn print_status(channel: &ServiceChannel) -> Result<()> {
    let health = channel.health_detail().await?;
    let pid = health.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string());
    match health.started_at {
        Some(started_at) => println!("running at {} (pid {}, since {})", channel.address(), pid, started_at.to_rfc3339()),
        None => println!("running at {} (pid {})", channel.address(), pid),
    }
    Ok(())
}

/// The service removes its registry entry as the last step of shutdown.
async fn wait_for_exit(registry: &ServiceRegistry) {
    for _ in 0..STOP_POLL_ATTEMPTS {
        if matches!(registry.read(), Ok(None)) {
            return;
        }
        tokio::time::sleep(STOP_POLL_DELAY).await;
    }
    tracing::warn!("Service did not confirm shutdown within {:?}", STOP_POLL_DELAY * STOP_POLL_ATTEMPTS);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
