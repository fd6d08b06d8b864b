//! Jicama Locker Consul - consul-backed lock coordination
//!
//! This crate provides:
//! - `ConsulClient`: thin adapter over the consul agent's session, KV,
//!   agent, and health endpoints
//! - `SessionLocker`: the lock engine (acquisition with bounded backoff,
//!   periodic session renewal, synchronous release)
//! - The service registration adjunct with TTL health-check keepalive
//!   and a blocking-query watch loop
//!
//! The engine is generic over `SessionBackend`; `ConsulLocker` is the
//! consul-backed configuration registered under the name "consul".

pub mod client;
pub mod config;
pub mod locker;
pub mod model;
mod registration;

pub use client::ConsulClient;
pub use config::ConsulLockerConfig;
pub use locker::{ConsulLocker, SessionLocker};

/// Registry name of this implementation.
pub const LOCKER_TYPE: &str = "consul";

/// Make the consul locker resolvable by name. The composition root calls
/// this once before building lockers from config.
pub fn register() {
    jicama_locker::register(LOCKER_TYPE, || Box::new(ConsulLocker::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolves_consul() {
        register();
        let locker = jicama_locker::new_locker(LOCKER_TYPE);
        assert!(locker.is_some());
        assert!(!locker.unwrap().is_locked("work/targets/leaf1"));
    }
}
