pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod launcher;

pub use bootstrap::{Bootstrap, BootstrapError, BootstrapState};
pub use channel::{CallError, ServiceChannel};
pub use config::ClientConfig;
pub use launcher::{ExecutableLauncher, Launcher};
