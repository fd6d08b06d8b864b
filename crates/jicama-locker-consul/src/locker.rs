//! Lock engine over a session backend
//!
//! `SessionLocker` keeps two disjoint maps per member: locks currently
//! being attempted and locks currently held. A key lives in at most one
//! of the two at any instant; both maps sit behind a single mutex and
//! every Attempting→Held transition happens under one guard. The guard
//! is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use jicama_locker::config::decode_config;
use jicama_locker::{
    Locker, LockerError, Result, Service, ServiceRegistration, SessionBackend, SessionBehavior,
    SessionOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ConsulClient;
use crate::config::ConsulLockerConfig;

/// One lock the member is attempting or holding.
#[derive(Clone)]
struct LockEntry {
    session_id: String,
    /// Single-shot relinquish signal. Cancelling it stops the renewal
    /// task and aborts an in-flight acquisition attempt for the key.
    done: CancellationToken,
}

#[derive(Default)]
struct LockRegistry {
    attempting: HashMap<String, LockEntry>,
    acquired: HashMap<String, LockEntry>,
}

/// Lock coordination over any session backend. The consul-backed
/// `ConsulLocker` is the shipped configuration; tests drive the same
/// engine over an in-memory backend.
pub struct SessionLocker<C: SessionBackend = ConsulClient> {
    cfg: ConsulLockerConfig,
    client: Option<Arc<C>>,
    locks: Mutex<LockRegistry>,
}

/// Consul-backed locker, registered under the name "consul".
pub type ConsulLocker = SessionLocker<ConsulClient>;

impl SessionLocker<ConsulClient> {
    /// An unconfigured locker; `init` must run before use.
    pub fn new() -> Self {
        Self {
            cfg: ConsulLockerConfig::default(),
            client: None,
            locks: Mutex::new(LockRegistry::default()),
        }
    }
}

impl Default for SessionLocker<ConsulClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: SessionBackend> SessionLocker<C> {
    /// Build a locker over an already-constructed backend. The config is
    /// normalized as `init` would.
    pub fn with_backend(mut cfg: ConsulLockerConfig, backend: C) -> Self {
        cfg.set_defaults();
        Self {
            cfg,
            client: Some(Arc::new(backend)),
            locks: Mutex::new(LockRegistry::default()),
        }
    }

    fn client(&self) -> Result<&Arc<C>> {
        self.client
            .as_ref()
            .ok_or_else(|| LockerError::Config("locker not initialized".to_string()))
    }

    fn registry(&self) -> MutexGuard<'_, LockRegistry> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drop_attempt(&self, key: &str) {
        self.registry().attempting.remove(key);
    }

    /// Sleep the retry backoff, returning early if either signal fires.
    async fn backoff(&self, cancel: &CancellationToken, done: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = done.cancelled() => {}
            _ = tokio::time::sleep(self.cfg.retry_timer()) => {}
        }
    }

    pub async fn lock(&self, key: &str, value: &[u8], cancel: &CancellationToken) -> Result<()> {
        let client = self.client()?.clone();
        let done = CancellationToken::new();
        let session_opts = SessionOptions {
            ttl: self.cfg.session_ttl(),
            lock_delay: self.cfg.delay(),
            // the backend drops the key itself when the session dies
            behavior: SessionBehavior::Delete,
        };

        loop {
            if cancel.is_cancelled() {
                self.drop_attempt(key);
                return Err(LockerError::Cancelled);
            }
            if done.is_cancelled() {
                self.drop_attempt(key);
                return Err(LockerError::LockerCancelled);
            }

            let session_id = tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = done.cancelled() => continue,
                res = client.create_session(&session_opts) => match res {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("failed creating session for '{}': {}", key, e);
                        self.backoff(cancel, &done).await;
                        continue;
                    }
                }
            };

            self.registry().attempting.insert(
                key.to_string(),
                LockEntry {
                    session_id: session_id.clone(),
                    done: done.clone(),
                },
            );

            let acquired = tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = done.cancelled() => continue,
                res = client.acquire(key, value, &session_id) => res,
            };
            match acquired {
                Err(e) => {
                    // the session is abandoned to its TTL
                    warn!("failed acquiring lock on '{}': {}", key, e);
                    self.backoff(cancel, &done).await;
                }
                Ok(true) => {
                    let mut registry = self.registry();
                    match registry.attempting.remove(key) {
                        Some(entry) if !entry.done.is_cancelled() => {
                            registry.acquired.insert(key.to_string(), entry);
                            return Ok(());
                        }
                        // unlock raced the acquire and already tore the
                        // session down
                        _ => return Err(LockerError::LockerCancelled),
                    }
                }
                Ok(false) => {
                    if self.cfg.debug {
                        debug!("failed acquiring lock on '{}': already locked", key);
                    }
                    self.backoff(cancel, &done).await;
                }
            }
        }
    }

    pub async fn keep_lock(&self, key: &str) -> (CancellationToken, mpsc::Receiver<LockerError>) {
        let (tx, rx) = mpsc::channel(1);
        let entry = self.registry().acquired.get(key).cloned();
        let Some(entry) = entry else {
            let done = CancellationToken::new();
            done.cancel();
            let _ = tx.try_send(LockerError::UnknownKey(key.to_string()));
            return (done, rx);
        };
        let client = match self.client() {
            Ok(c) => c.clone(),
            Err(e) => {
                let done = CancellationToken::new();
                done.cancel();
                let _ = tx.try_send(e);
                return (done, rx);
            }
        };

        let period = self.cfg.renew_period();
        let done = entry.done.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = client
                .renew_periodic(period, &entry.session_id, &entry.done)
                .await
            {
                warn!("lost renewal of lock '{}': {}", key, e);
                let _ = tx.send(LockerError::RenewalLost(e.to_string())).await;
            }
        });

        (done, rx)
    }

    pub async fn unlock(&self, key: &str) -> Result<()> {
        let (entry, was_held) = {
            let mut registry = self.registry();
            if let Some(entry) = registry.acquired.remove(key) {
                (entry, true)
            } else if let Some(entry) = registry.attempting.remove(key) {
                (entry, false)
            } else {
                return Err(LockerError::UnknownKey(key.to_string()));
            }
        };
        entry.done.cancel();

        let client = self.client()?;
        if was_held {
            // the entry is already gone from the registry; surface the
            // first backend failure after attempting both calls
            let deleted = client.delete_key(key).await;
            let destroyed = client.destroy_session(&entry.session_id).await;
            deleted.and(destroyed)?;
        } else {
            client.destroy_session(&entry.session_id).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let keys: Vec<String> = self.registry().acquired.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.unlock(&key).await {
                warn!("failed releasing lock '{}' on stop: {}", key, e);
            }
        }
        Ok(())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.registry().acquired.contains_key(key)
    }

    pub async fn list(&self, prefix: &str) -> Result<HashMap<String, String>> {
        Ok(self.client()?.list_keys(prefix).await?)
    }

    pub async fn register(&self, reg: &ServiceRegistration) -> Result<()> {
        Ok(self.client()?.register_service(reg).await?)
    }

    pub async fn deregister(&self, id: &str) -> Result<()> {
        Ok(self.client()?.deregister_service(id).await?)
    }

    pub async fn get_services(&self, name: &str, tags: &[String]) -> Result<Vec<Service>> {
        Ok(self.client()?.services(name, tags).await?)
    }

    pub async fn watch_services(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(self
            .client()?
            .watch_services(name, tags, tx, cancel)
            .await?)
    }
}

#[async_trait]
impl Locker for SessionLocker<ConsulClient> {
    async fn init(&mut self, cfg: serde_json::Value) -> Result<()> {
        let mut parsed: ConsulLockerConfig = decode_config(cfg)?;
        parsed.set_defaults();
        let client =
            ConsulClient::new(&parsed.address).map_err(|e| LockerError::Config(e.to_string()))?;
        info!("initialized consul locker with cfg={}", parsed);
        self.cfg = parsed;
        self.client = Some(Arc::new(client));
        Ok(())
    }

    async fn lock(&self, key: &str, value: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.lock(key, value, cancel).await
    }

    async fn keep_lock(&self, key: &str) -> (CancellationToken, mpsc::Receiver<LockerError>) {
        self.keep_lock(key).await
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.unlock(key).await
    }

    async fn stop(&self) -> Result<()> {
        self.stop().await
    }

    fn is_locked(&self, key: &str) -> bool {
        self.is_locked(key)
    }

    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>> {
        self.list(prefix).await
    }

    async fn register(&self, reg: &ServiceRegistration) -> Result<()> {
        self.register(reg).await
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.deregister(id).await
    }

    async fn get_services(&self, name: &str, tags: &[String]) -> Result<Vec<Service>> {
        self.get_services(name, tags).await
    }

    async fn watch_services(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.watch_services(name, tags, tx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlock_unknown_key() {
        let locker = ConsulLocker::new();
        let err = locker.unlock("work/targets/leaf1").await.unwrap_err();
        assert!(matches!(err, LockerError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn test_keep_lock_unknown_key() {
        let locker = ConsulLocker::new();
        let (done, mut errs) = locker.keep_lock("work/targets/leaf1").await;
        assert!(done.is_cancelled());
        let err = errs.recv().await.unwrap();
        assert!(matches!(err, LockerError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn test_stop_on_empty_registry() {
        let locker = ConsulLocker::new();
        assert!(locker.stop().await.is_ok());
        assert!(locker.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_requires_init() {
        let locker = ConsulLocker::new();
        let cancel = CancellationToken::new();
        let err = locker.lock("work/targets/leaf1", b"member-1", &cancel).await;
        assert!(matches!(err, Err(LockerError::Config(_))));
    }

    #[test]
    fn test_is_locked_on_fresh_locker() {
        let locker = ConsulLocker::new();
        assert!(!locker.is_locked("work/targets/leaf1"));
    }
}
