use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::types::RecordKind;
use tracing::{debug, info, warn};

use crate::config::RotationConfig;
use crate::store::RecordStore;
use crate::task::{BackgroundTask, PeriodicWork, TickFlow};

/// The encryption collaborator, as far as rotation is concerned. Sealing
/// bytes is its business; the sweep only decides when to ask.
#[async_trait]
pub trait KeyRotator: Send + Sync {
    async fn list_rotation_candidates(&self) -> Result<Vec<String>>;

    async fn needs_rotation(&self, name: &str, max_age: chrono::Duration) -> Result<bool>;

    async fn rotate(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub rotated: usize,
    pub failed: usize,
}

pub struct RotationSweep {
    rotator: Arc<dyn KeyRotator>,
    max_age: chrono::Duration,
    initial_delay: Duration,
    interval: Duration,
}

impl RotationSweep {
    pub fn new(rotator: Arc<dyn KeyRotator>, config: &RotationConfig) -> Self {
        Self {
            rotator,
            max_age: config.max_age(),
            initial_delay: config.initial_delay(),
            interval: config.interval(),
        }
    }

    /// Check every candidate once. A failure on one item is logged and the
    /// sweep moves on to the next.
    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        let candidates = match self.rotator.list_rotation_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to list rotation candidates: {:#}", e);
                return summary;
            }
        };

        for name in candidates {
            summary.checked += 1;
            match self.rotator.needs_rotation(&name, self.max_age).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!("Failed to check key age for {}: {:#}", name, e);
                    summary.failed += 1;
                    continue;
                }
            }

            match self.rotator.rotate(&name).await {
                Ok(()) => {
                    info!("Rotated key for {}", name);
                    summary.rotated += 1;
                }
                Err(e) => {
                    warn!("Failed to rotate key for {}: {:#}", name, e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[async_trait]
impl PeriodicWork for RotationSweep {
    fn name(&self) -> &'static str {
        "key-rotation"
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> TickFlow {
        let summary = self.sweep().await;
        info!(
            checked = summary.checked,
            rotated = summary.rotated,
            failed = summary.failed,
            "Key rotation sweep finished"
        );
        TickFlow::Continue
    }
}

pub type RotationScheduler = BackgroundTask<RotationSweep>;

/// Tracks per-profile key generations in the record store. Minting a new
/// generation is what "rotate" means here; sealing itself stays external.
pub struct ProfileKeyLedger {
    store: Arc<dyn RecordStore>,
}

impl ProfileKeyLedger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyRotator for ProfileKeyLedger {
    async fn list_rotation_candidates(&self) -> Result<Vec<String>> {
        let profiles = self.store.list(RecordKind::Profile).await?;
        Ok(profiles.into_iter().map(|p| p.name).collect())
    }

    async fn needs_rotation(&self, name: &str, max_age: chrono::Duration) -> Result<bool> {
        Ok(match self.store.key_meta(name).await? {
            None => true,
            Some(meta) => Utc::now() - meta.created_at >= max_age,
        })
    }

    async fn rotate(&self, name: &str) -> Result<()> {
        let meta = self
            .store
            .rotate_key(name)
            .await
            .with_context(|| format!("Failed to rotate key for profile {}", name))?;
        debug!("Profile {} now at key generation {}", name, meta.generation);
        Ok(())
    }
}
