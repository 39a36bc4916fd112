use std::thread;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use shared::types::{Record, RecordKind};
use crate::store::{db::RecordDb, KeyMeta, RecordStore};

/// Commands sent to the store thread
pub enum StoreCommand {
    Get(RecordKind, String, oneshot::Sender<Result<Option<Record>>>),
    List(RecordKind, oneshot::Sender<Result<Vec<Record>>>),
    Put(RecordKind, String, serde_json::Value, oneshot::Sender<Result<Record>>),
    Delete(RecordKind, String, oneshot::Sender<Result<bool>>),
    GetKey(String, oneshot::Sender<Result<Option<KeyMeta>>>),
    RotateKey(String, oneshot::Sender<Result<KeyMeta>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the thread that owns the SQLite connection
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread with the given database
    pub fn spawn(db: RecordDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Get(kind, name, reply) => {
                        let _ = reply.send(db.get(kind, &name));
                    }
                    StoreCommand::List(kind, reply) => {
                        let _ = reply.send(db.list(kind));
                    }
                    StoreCommand::Put(kind, name, data, reply) => {
                        let _ = reply.send(db.put(kind, &name, &data));
                    }
                    StoreCommand::Delete(kind, name, reply) => {
                        let _ = reply.send(db.delete(kind, &name));
                    }
                    StoreCommand::GetKey(profile, reply) => {
                        let _ = reply.send(db.key_meta(&profile));
                    }
                    StoreCommand::RotateKey(profile, reply) => {
                        let _ = reply.send(db.rotate_key(&profile));
                    }
                    StoreCommand::Shutdown(reply) => {
                        tracing::info!("Store thread shutting down");
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Stop the store thread once queued commands are drained
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Shutdown(reply))
            .await
            .context("Store thread already stopped")?;
        rx.await.context("Store thread exited before acknowledging shutdown")?;
        Ok(())
    }

    async fn request<T>(&self, cmd: StoreCommand, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx.send(cmd).await.context("Store thread is not running")?;
        rx.await.context("Store thread dropped the request")?
    }
}

#[async_trait]
impl RecordStore for StoreHandle {
    async fn get(&self, kind: RecordKind, name: &str) -> Result<Option<Record>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Get(kind, name.to_string(), reply), rx).await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::List(kind, reply), rx).await
    }

    async fn put(&self, kind: RecordKind, name: &str, data: serde_json::Value) -> Result<Record> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Put(kind, name.to_string(), data, reply), rx).await
    }

    async fn delete(&self, kind: RecordKind, name: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Delete(kind, name.to_string(), reply), rx).await
    }

    async fn key_meta(&self, profile: &str) -> Result<Option<KeyMeta>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::GetKey(profile.to_string(), reply), rx).await
    }

    async fn rotate_key(&self, profile: &str) -> Result<KeyMeta> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::RotateKey(profile.to_string(), reply), rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_round_trips_through_thread() {
        let store = StoreHandle::spawn(RecordDb::open(":memory:").unwrap());

        store.put(RecordKind::Repository, "site", json!({"url": "https://example.com/site.git"})).await.unwrap();
        let listed = store.list(RecordKind::Repository).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "site");

        assert!(store.delete(RecordKind::Repository, "site").await.unwrap());
        assert!(store.get(RecordKind::Repository, "site").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let store = StoreHandle::spawn(RecordDb::open(":memory:").unwrap());
        store.shutdown().await.unwrap();

        assert!(store.list(RecordKind::Profile).await.is_err());
        assert!(store.shutdown().await.is_err());
    }
}
