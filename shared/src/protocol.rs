use std::path::PathBuf;

/// Application name. Also the substring the liveness check looks for in a
/// process image name.
pub const APP_NAME: &str = "repokeep";

/// Name of the service binary that gets spawned on demand.
pub const SERVICE_BINARY: &str = "repokeepd";

/// Port the service binds when nothing else is configured.
pub const DEFAULT_PORT: u16 = 47_310;

pub const HEALTH_PATH: &str = "/v1/health";
pub const RECORDS_PATH: &str = "/v1/records";
pub const SHUTDOWN_PATH: &str = "/v1/service/shutdown";

/// Caller-supplied absolute deadline, unix epoch milliseconds.
pub const DEADLINE_HEADER: &str = "x-repokeep-deadline-ms";

/// Registry file name inside the per-user state directory.
pub const REGISTRY_FILE: &str = "server.json";

/// Log file the on-demand service writes to.
pub const SERVICE_LOG_FILE: &str = "service.log";

/// Environment override for the service address.
pub const ADDR_ENV: &str = "REPOKEEP_ADDR";

/// Per-user state directory, e.g. `~/.cache/repokeep`.
pub fn state_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(APP_NAME))
}

/// Address string the registry records for a given port.
pub fn local_address(port: u16) -> String {
    format!("localhost:{}", port)
}
