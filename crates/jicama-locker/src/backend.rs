//! Session backend abstraction
//!
//! The capabilities a consistent KV store must provide for lock
//! coordination: sessions with a TTL, compare-and-set key acquisition
//! bound to a session, and session renewal/destruction. Service
//! registration is optional; backends without it keep the provided
//! `unsupported` defaults.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{Service, ServiceRegistration};

/// What the backend does with keys bound to a session when the session
/// is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBehavior {
    /// Unbind the keys but keep them.
    Release,
    /// Drop the keys entirely. Lock sessions use this so a crashed
    /// holder leaves nothing behind.
    Delete,
}

impl SessionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

/// Options for creating a backend session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Duration after which an unrenewed session is invalidated.
    pub ttl: Duration,
    /// Grace period after invalidation before released keys become
    /// acquirable again.
    pub lock_delay: Duration,
    pub behavior: SessionBehavior,
}

/// Consistent KV + session primitives a locker implementation builds on.
///
/// All methods must be safe for concurrent use.
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Create a new session, returning its opaque ID.
    async fn create_session(&self, opts: &SessionOptions) -> anyhow::Result<String>;

    /// Compare-and-set acquisition: bind `key` to `session` with `value`
    /// as payload. Succeeds iff the key is not currently bound to a live
    /// session. Returns whether the bind took effect.
    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> anyhow::Result<bool>;

    /// Extend the session's TTL. Fails if the session no longer exists.
    async fn renew_session(&self, session: &str) -> anyhow::Result<()>;

    /// Invalidate the session, applying its behavior to bound keys.
    async fn destroy_session(&self, session: &str) -> anyhow::Result<()>;

    async fn delete_key(&self, key: &str) -> anyhow::Result<()>;

    /// All keys under `prefix` with their payloads.
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Renew `session` every `period` until `done` fires or a renewal
    /// fails. Once `done` is cancelled the loop exits promptly without
    /// further backend calls.
    async fn renew_periodic(
        &self,
        period: Duration,
        session: &str,
        done: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = done.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {}
            }
            self.renew_session(session).await?;
        }
    }

    async fn register_service(&self, _reg: &ServiceRegistration) -> anyhow::Result<()> {
        anyhow::bail!("service registration not supported by this backend")
    }

    async fn deregister_service(&self, _id: &str) -> anyhow::Result<()> {
        anyhow::bail!("service registration not supported by this backend")
    }

    /// Healthy instances of `name` carrying all of `tags`.
    async fn services(&self, _name: &str, _tags: &[String]) -> anyhow::Result<Vec<Service>> {
        anyhow::bail!("service discovery not supported by this backend")
    }

    /// Push the instance set of `name` to `tx` on every change until
    /// `done` fires or the receiver is dropped.
    async fn watch_services(
        &self,
        _name: &str,
        _tags: &[String],
        _tx: mpsc::Sender<Vec<Service>>,
        _done: &CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::bail!("service discovery not supported by this backend")
    }
}
