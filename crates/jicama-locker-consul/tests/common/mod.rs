//! In-memory session backend for driving the lock engine in tests.
//!
//! Mirrors the backend semantics the locker depends on: TTL-bound
//! sessions, compare-and-set key acquisition, behavior on invalidation,
//! and the lock-delay barrier after a session dies. Expired sessions are
//! reaped lazily on each operation.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jicama_locker::{
    Service, ServiceRegistration, SessionBackend, SessionBehavior, SessionOptions,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

struct MemSession {
    ttl: Duration,
    lock_delay: Duration,
    behavior: SessionBehavior,
    expires_at: Instant,
}

struct MemPair {
    value: Vec<u8>,
    session: Option<String>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    sessions: Arc<DashMap<String, MemSession>>,
    kv: Arc<DashMap<String, MemPair>>,
    /// key → instant it becomes acquirable again
    delays: Arc<DashMap<String, Instant>>,
    services: Arc<DashMap<String, ServiceRegistration>>,
    changed: Arc<Notify>,
    fail_sessions: Arc<AtomicBool>,
    fail_renewals: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            kv: Arc::new(DashMap::new()),
            delays: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            changed: Arc::new(Notify::new()),
            fail_sessions: Arc::new(AtomicBool::new(false)),
            fail_renewals: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make session creation fail, as if the agent were unreachable.
    pub fn fail_sessions(&self, on: bool) {
        self.fail_sessions.store(on, Ordering::Relaxed);
    }

    /// Make renewals fail, as if the agent became unreachable after the
    /// lock was acquired.
    pub fn fail_renewals(&self, on: bool) {
        self.fail_renewals.store(on, Ordering::Relaxed);
    }

    pub fn live_session_count(&self) -> usize {
        self.reap();
        self.sessions.len()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    pub fn bound_session(&self, key: &str) -> Option<String> {
        self.kv.get(key).and_then(|p| p.session.clone())
    }

    pub fn value_of(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get(key).map(|p| p.value.clone())
    }

    fn reap(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for id in expired {
            self.invalidate(&id);
        }
    }

    /// Remove the session and apply its behavior to bound keys.
    fn invalidate(&self, session: &str) {
        let Some((_, sess)) = self.sessions.remove(session) else {
            return;
        };
        let bound: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.session.as_deref() == Some(session))
            .map(|e| e.key().clone())
            .collect();
        for key in bound {
            match sess.behavior {
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                }
                SessionBehavior::Release => {
                    if let Some(mut pair) = self.kv.get_mut(&key) {
                        pair.session = None;
                    }
                }
            }
            if !sess.lock_delay.is_zero() {
                self.delays.insert(key, Instant::now() + sess.lock_delay);
            }
        }
        self.changed.notify_waiters();
    }

    fn collect_services(&self, name: &str, tags: &[String]) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|reg| reg.name == name && tags.iter().all(|t| reg.tags.contains(t)))
            .map(|reg| Service {
                id: reg.id.clone(),
                address: format!("{}:{}", reg.address, reg.port),
                tags: reg.tags.clone(),
            })
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn create_session(&self, opts: &SessionOptions) -> anyhow::Result<String> {
        if self.fail_sessions.load(Ordering::Relaxed) {
            anyhow::bail!("connection refused");
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            MemSession {
                ttl: opts.ttl,
                lock_delay: opts.lock_delay,
                behavior: opts.behavior,
                expires_at: Instant::now() + opts.ttl,
            },
        );
        Ok(id)
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> anyhow::Result<bool> {
        self.reap();
        if !self.sessions.contains_key(session) {
            anyhow::bail!("invalid session '{session}'");
        }
        if let Some(until) = self.delays.get(key)
            && *until > Instant::now()
        {
            return Ok(false);
        }
        let mut pair = self.kv.entry(key.to_string()).or_insert_with(|| MemPair {
            value: value.to_vec(),
            session: None,
        });
        if let Some(holder) = &pair.session
            && self.sessions.contains_key(holder)
        {
            return Ok(false);
        }
        pair.value = value.to_vec();
        pair.session = Some(session.to_string());
        Ok(true)
    }

    async fn renew_session(&self, session: &str) -> anyhow::Result<()> {
        if self.fail_renewals.load(Ordering::Relaxed) {
            anyhow::bail!("agent unreachable");
        }
        self.reap();
        match self.sessions.get_mut(session) {
            Some(mut s) => {
                let ttl = s.ttl;
                s.expires_at = Instant::now() + ttl;
                Ok(())
            }
            None => anyhow::bail!("session '{session}' not found or expired"),
        }
    }

    async fn destroy_session(&self, session: &str) -> anyhow::Result<()> {
        self.invalidate(session);
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> anyhow::Result<()> {
        // a released lock only becomes acquirable again after the holder
        // session's lock delay
        if let Some((key, pair)) = self.kv.remove(key)
            && let Some(holder) = pair.session
            && let Some(sess) = self.sessions.get(&holder)
            && !sess.lock_delay.is_zero()
        {
            self.delays.insert(key, Instant::now() + sess.lock_delay);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> anyhow::Result<HashMap<String, String>> {
        self.reap();
        Ok(self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| {
                (
                    e.key().clone(),
                    String::from_utf8_lossy(&e.value).into_owned(),
                )
            })
            .collect())
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> anyhow::Result<()> {
        self.services.insert(reg.id.clone(), reg.clone());
        self.changed.notify_waiters();
        Ok(())
    }

    async fn deregister_service(&self, id: &str) -> anyhow::Result<()> {
        self.services.remove(id);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn services(&self, name: &str, tags: &[String]) -> anyhow::Result<Vec<Service>> {
        Ok(self.collect_services(name, tags))
    }

    async fn watch_services(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        done: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut last: Option<Vec<Service>> = None;
        loop {
            if done.is_cancelled() {
                return Ok(());
            }
            let current = self.collect_services(name, tags);
            if last.as_ref() != Some(&current) {
                if tx.send(current.clone()).await.is_err() {
                    return Ok(());
                }
                last = Some(current);
            }
            tokio::select! {
                _ = done.cancelled() => return Ok(()),
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
            }
        }
    }
}
