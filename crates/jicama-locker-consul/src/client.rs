//! Consul HTTP backend adapter
//!
//! Thin binding to the consul agent's session, KV, agent, and health
//! endpoints. Errors stay at the transport level (`anyhow`); the locker
//! engine decides which are terminal and which to retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jicama_locker::config::format_duration;
use jicama_locker::{Service, ServiceRegistration, SessionBackend, SessionOptions};
use reqwest::{Response, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{
    AgentServiceRegistration, KVPair, SessionCreateRequest, SessionCreateResponse,
};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a consul agent.
///
/// Cloning is cheap; clones share the connection pool and the keepalive
/// task table for registered services.
#[derive(Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: String,
    /// Keepalive tasks for registered services: service ID → cancel token.
    pub(crate) keepalives: Arc<DashMap<String, CancellationToken>>,
}

impl ConsulClient {
    pub fn new(address: &str) -> anyhow::Result<Self> {
        let address = address.trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            keepalives: Arc::new(DashMap::new()),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) async fn check_status(resp: Response) -> anyhow::Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("consul request failed with status {status}: {body}")
    }
}

#[async_trait]
impl SessionBackend for ConsulClient {
    async fn create_session(&self, opts: &SessionOptions) -> anyhow::Result<String> {
        let body = SessionCreateRequest {
            name: None,
            ttl: Some(format_duration(opts.ttl)),
            lock_delay: Some(format_duration(opts.lock_delay)),
            behavior: Some(opts.behavior.as_str().to_string()),
        };
        let resp = self
            .client
            .put(self.url("/v1/session/create"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let created: SessionCreateResponse = resp.json().await?;
        Ok(created.id)
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> anyhow::Result<bool> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}")))
            .query(&[("acquire", session)])
            .timeout(REQUEST_TIMEOUT)
            .body(value.to_vec())
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let acquired: bool = resp.json().await?;
        Ok(acquired)
    }

    async fn renew_session(&self, session: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/session/renew/{session}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            anyhow::bail!("session '{session}' not found or expired");
        }
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn destroy_session(&self, session: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/session/destroy/{session}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/kv/{key}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> anyhow::Result<HashMap<String, String>> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/kv/{prefix}")))
            .query(&[("recurse", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        // consul answers 404 for an empty prefix
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }
        let resp = Self::check_status(resp).await?;
        let pairs: Vec<KVPair> = resp.json().await?;
        Ok(pairs
            .into_iter()
            .map(|p| {
                let value = p.decoded_value().unwrap_or_default();
                (p.key, value)
            })
            .collect())
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> anyhow::Result<()> {
        let payload = AgentServiceRegistration::from(reg);
        let resp = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        Self::check_status(resp).await?;
        if let Some(ttl) = reg.ttl {
            self.spawn_keepalive(&reg.id, ttl / 2);
        }
        Ok(())
    }

    async fn deregister_service(&self, id: &str) -> anyhow::Result<()> {
        if let Some((_, token)) = self.keepalives.remove(id) {
            token.cancel();
        }
        let resp = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn services(&self, name: &str, tags: &[String]) -> anyhow::Result<Vec<Service>> {
        let (entries, _) = self.health_service(name, tags, 0).await?;
        Ok(crate::registration::entries_to_services(entries))
    }

    async fn watch_services(
        &self,
        name: &str,
        tags: &[String],
        tx: mpsc::Sender<Vec<Service>>,
        done: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.run_service_watch(name, tags, tx, done).await
    }
}
