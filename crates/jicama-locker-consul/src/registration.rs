//! Service registration adjunct
//!
//! Members advertise themselves as service instances so peers can
//! discover each other. A TTL health check is kept passing by a
//! background task per registered instance; peer discovery uses the
//! health endpoint, with blocking queries for the watch loop.

use std::time::Duration;

use jicama_locker::Service;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ConsulClient, REQUEST_TIMEOUT};
use crate::model::ServiceEntry;

/// How long one blocking query on the health endpoint is held open.
const WATCH_WAIT: Duration = Duration::from_secs(55);
/// Backoff after a failed watch query.
const WATCH_RETRY: Duration = Duration::from_secs(2);

impl ConsulClient {
    /// Keep the TTL check of a registered service passing every
    /// `interval` until the service is deregistered. Re-registering the
    /// same ID replaces the previous task.
    pub(crate) fn spawn_keepalive(&self, id: &str, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(prev) = self.keepalives.insert(id.to_string(), token.clone()) {
            prev.cancel();
        }
        let client = self.clone();
        let check_id = format!("service:{id}");
        tokio::spawn(async move {
            // the check starts critical until its first pass
            if let Err(e) = client.pass_ttl_check(&check_id).await {
                warn!("failed passing ttl check '{}': {}", check_id, e);
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = client.pass_ttl_check(&check_id).await {
                    warn!("failed passing ttl check '{}': {}", check_id, e);
                }
            }
        });
    }

    pub(crate) async fn pass_ttl_check(&self, check_id: &str) -> anyhow::Result<()> {
        let resp = self
            .http()
            .put(self.url(&format!("/v1/agent/check/pass/{check_id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// Healthy instances of `name` carrying all of `tags`. With a
    /// non-zero `index` the query blocks until the instance set changes
    /// or the wait time elapses. Returns the entries and the new index.
    pub(crate) async fn health_service(
        &self,
        name: &str,
        tags: &[String],
        index: u64,
    ) -> anyhow::Result<(Vec<ServiceEntry>, u64)> {
        let mut req = self
            .http()
            .get(self.url(&format!("/v1/health/service/{name}")))
            .query(&[("passing", "true")]);
        for tag in tags {
            req = req.query(&[("tag", tag)]);
        }
        let req = if index > 0 {
            req.query(&[
                ("index", index.to_string()),
                ("wait", jicama_locker::config::format_duration(WATCH_WAIT)),
            ])
            .timeout(WATCH_WAIT + REQUEST_TIMEOUT)
        } else {
            req.timeout(REQUEST_TIMEOUT)
        };

        let resp = req.send().await?;
        let resp = Self::check_status(resp).await?;
        let new_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let entries: Vec<ServiceEntry> = resp.json().await?;
        Ok((entries, new_index))
    }

    /// Blocking-query loop pushing each new instance set to `tx` until
    /// `done` fires or the receiver is dropped.
    pub(crate) async fn run_service_watch(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        done: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut index = 0u64;
        let mut last: Option<Vec<Service>> = None;
        loop {
            let result = tokio::select! {
                _ = done.cancelled() => return Ok(()),
                r = self.health_service(name, tags, index) => r,
            };
            match result {
                Ok((entries, new_index)) => {
                    // a backwards index means the view was reset
                    index = if new_index < index { 0 } else { new_index };
                    let services = entries_to_services(entries);
                    if last.as_ref() != Some(&services) {
                        if tx.send(services.clone()).await.is_err() {
                            return Ok(());
                        }
                        last = Some(services);
                    }
                }
                Err(e) => {
                    warn!("service watch for '{}' failed: {}", name, e);
                    tokio::select! {
                        _ = done.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(WATCH_RETRY) => {}
                    }
                }
            }
            debug!("service watch for '{}' at index {}", name, index);
        }
    }
}

pub(crate) fn entries_to_services(entries: Vec<ServiceEntry>) -> Vec<Service> {
    let mut services: Vec<Service> = entries
        .into_iter()
        .map(|e| Service {
            id: e.service.id,
            address: format!("{}:{}", e.service.address, e.service.port),
            tags: e.service.tags,
        })
        .collect();
    services.sort_by(|a, b| a.id.cmp(&b.id));
    services
}
