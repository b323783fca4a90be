use std::thread;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::Result;
use shared::types::{ClientRecord, MacAddress};
use crate::cache::store::{CacheEntry, PresenceCache};

/// Commands sent to the cache thread
pub enum CacheCommand {
    Upsert {
        record: ClientRecord,
        lifespan: Duration,
        reply: oneshot::Sender<Option<CacheEntry>>,
    },
    Evict(MacAddress, oneshot::Sender<Option<CacheEntry>>),
    Lookup(MacAddress, oneshot::Sender<Option<CacheEntry>>),
    Expire(DateTime<Utc>, oneshot::Sender<Vec<CacheEntry>>),
    GetAll(oneshot::Sender<Vec<CacheEntry>>),
    Shutdown,
}

/// Handle to the presence cache. Cloned into every poll cycle.
///
/// The cache itself lives on a dedicated thread, so each command is applied
/// atomically and in arrival order no matter how many cycles overlap.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Spawn a new cache thread owning `cache`
    pub fn spawn(cache: PresenceCache, count_tx: watch::Sender<usize>) -> Self {
        let (tx, mut rx) = mpsc::channel::<CacheCommand>(256);

        thread::spawn(move || {
            let mut cache = cache;
            let _ = count_tx.send(cache.len());

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    CacheCommand::Upsert { record, lifespan, reply } => {
                        let replaced = cache.upsert(record, lifespan);
                        if replaced.is_none() {
                            let _ = count_tx.send(cache.len());
                        }
                        let _ = reply.send(replaced);
                    }
                    CacheCommand::Evict(mac, reply) => {
                        let removed = cache.evict(&mac);
                        if removed.is_some() {
                            let _ = count_tx.send(cache.len());
                        }
                        let _ = reply.send(removed);
                    }
                    CacheCommand::Lookup(mac, reply) => {
                        let _ = reply.send(cache.lookup(&mac).cloned());
                    }
                    CacheCommand::Expire(now, reply) => {
                        let expired = cache.expire(now);
                        if !expired.is_empty() {
                            let _ = count_tx.send(cache.len());
                        }
                        let _ = reply.send(expired);
                    }
                    CacheCommand::GetAll(reply) => {
                        let _ = reply.send(cache.entries());
                    }
                    CacheCommand::Shutdown => {
                        tracing::info!("Cache thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Insert or refresh a client. Returns the entry it replaced.
    pub async fn upsert(&self, record: ClientRecord, lifespan: Duration) -> Result<Option<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Upsert { record, lifespan, reply }).await?;
        Ok(rx.await?)
    }

    /// Remove a client; a no-op when it is not cached
    pub async fn evict(&self, mac: MacAddress) -> Result<Option<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Evict(mac, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn lookup(&self, mac: MacAddress) -> Result<Option<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Lookup(mac, reply)).await?;
        Ok(rx.await?)
    }

    /// Retire entries whose deadline passed before `now`
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Expire(now, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_all(&self) -> Result<Vec<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::GetAll(reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the cache thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(CacheCommand::Shutdown).await?;
        Ok(())
    }
}
