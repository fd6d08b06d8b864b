//! Jicama Locker - distributed lock coordination contract
//!
//! This crate provides:
//! - The `Locker` contract: attempt, hold, renew, release, and recover
//!   exclusive ownership of work keys across cluster members
//! - A process-wide name→factory registry for locker implementations
//! - The `SessionBackend` capability trait implementations build on
//! - Shared error taxonomy and config decoding helpers
//!
//! A member that holds the lock for a key is the exclusive owner of the
//! associated work; members that do not hold it must not touch it. Locks
//! are backed by an external consistent KV store with TTL-bound
//! sessions, so a crashed holder's keys are reclaimed once its session
//! expires.

pub mod backend;
pub mod config;
pub mod error;
pub mod model;

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use backend::{SessionBackend, SessionBehavior, SessionOptions};
pub use error::{LockerError, Result};
pub use model::{Service, ServiceRegistration};

/// Distributed lock coordination over a session-backed KV store.
///
/// All methods are safe to call from any task. `lock` may block
/// indefinitely; callers bound it through the cancellation token they
/// pass in.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Validate and normalize the raw config section and open the
    /// backend client. Must be called once before any other method.
    async fn init(&mut self, cfg: serde_json::Value) -> Result<()>;

    /// Block until the lock on `key` is held by this member (`Ok`), the
    /// caller's token fires (`Cancelled`), or `unlock`/`stop` aborts the
    /// attempt (`LockerCancelled`). `value` is stored as the key's
    /// payload and is opaque to the locker; callers typically embed
    /// their identity.
    async fn lock(&self, key: &str, value: &[u8], cancel: &CancellationToken) -> Result<()>;

    /// Start renewing the session behind a held key. Returns the entry's
    /// done token (cancel it to relinquish) and a single-use error
    /// channel that receives at most one error if renewal terminates
    /// unsuccessfully. An unheld key yields an already-cancelled token
    /// and an immediate `UnknownKey` on the channel.
    async fn keep_lock(
        &self,
        key: &str,
    ) -> (CancellationToken, mpsc::Receiver<LockerError>);

    /// Release `key` whether it is held or still being attempted.
    async fn unlock(&self, key: &str) -> Result<()>;

    /// Release every held key. Best effort; per-key failures are logged.
    async fn stop(&self) -> Result<()>;

    /// Whether this member currently holds `key`. Local bookkeeping
    /// only; the backend is not consulted.
    fn is_locked(&self, key: &str) -> bool;

    /// Keys under `prefix` in the backend with their payloads.
    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>>;

    /// Advertise this member as a service instance.
    async fn register(&self, reg: &ServiceRegistration) -> Result<()>;

    async fn deregister(&self, id: &str) -> Result<()>;

    /// Healthy instances of `name` carrying all of `tags`.
    async fn get_services(&self, name: &str, tags: &[String]) -> Result<Vec<Service>>;

    /// Push the instance set of `name` to `tx` on every change until
    /// `cancel` fires.
    async fn watch_services(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Factory producing a fresh, uninitialized locker instance.
pub type Initializer = fn() -> Box<dyn Locker>;

static LOCKERS: LazyLock<RwLock<HashMap<&'static str, Initializer>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a locker implementation under `name`. Implementations do not
/// self-register; the composition root calls this before resolving
/// lockers by name.
pub fn register(name: &'static str, init: Initializer) {
    LOCKERS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name, init);
}

/// Produce a fresh locker instance for `name`, if registered.
pub fn new_locker(name: &str) -> Option<Box<dyn Locker>> {
    LOCKERS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .map(|init| init())
}

/// Names of all registered locker implementations.
pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = LOCKERS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .copied()
        .collect();
    names.sort_unstable();
    names
}
