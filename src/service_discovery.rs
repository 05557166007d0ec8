//! Service registry and a local cache materialized from a prefix watch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::EventType;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connector::{cancel_watcher, Connector, KeepAliveHandle};
use crate::error::{Error, Result};
use crate::util::require_non_empty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Dynamic,
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub json_payload: String,
    pub address: String,
    pub port: i32,
    pub ssl_port: i32,
    pub registration_time_utc: i64,
    pub service_type: ServiceType,
    pub uri: String,
    pub enabled: bool,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct ServiceDiscoveryConfig {
    pub names_path: String,
    pub lease_ttl_secs: i64,
    pub keep_alive_interval: Duration,
}

impl Default for ServiceDiscoveryConfig {
    fn default() -> Self {
        Self {
            names_path: String::new(),
            lease_ttl_secs: 30,
            keep_alive_interval: Duration::from_secs(10),
        }
    }
}

struct Registration {
    lease_id: i64,
    keep_alive: KeepAliveHandle,
}

pub struct ServiceDiscovery {
    connector: Connector,
    config: ServiceDiscoveryConfig,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl ServiceDiscovery {
    pub fn new(connector: Connector, config: ServiceDiscoveryConfig) -> Result<Self> {
        require_non_empty("names_path", &config.names_path)?;
        Ok(Self {
            connector,
            config,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!("{}/{}/{}", self.config.names_path, instance.name, instance.id)
    }

    /// Registers a new instance under a fresh lease and starts its
    /// keep-alive. The instance disappears automatically if this process
    /// dies without calling `unregister_service`.
    pub async fn register_service(&self, instance: ServiceInstance) -> Result<()> {
        let key = self.instance_key(&instance);
        let value = serde_json::to_vec(&instance)?;
        let lease_id = self.connector.lease_grant(self.config.lease_ttl_secs).await?;
        self.connector.put(&key, value, Some(lease_id)).await?;
        let keep_alive = self.connector.keep_alive(lease_id, self.config.keep_alive_interval)?;
        self.registrations
            .lock()
            .await
            .insert(instance.id.clone(), Registration { lease_id, keep_alive });
        Ok(())
    }

    /// Rewrites an already-registered instance's payload, reusing its
    /// existing lease so the registration's remaining TTL is unaffected.
    pub async fn update_service(&self, instance: ServiceInstance) -> Result<()> {
        let lease_id = {
            let registrations = self.registrations.lock().await;
            registrations
                .get(&instance.id)
                .map(|r| r.lease_id)
                .ok_or_else(|| Error::IllegalState(format!("instance {} is not registered", instance.id)))?
        };
        let key = self.instance_key(&instance);
        let value = serde_json::to_vec(&instance)?;
        self.connector.put(&key, value, Some(lease_id)).await?;
        Ok(())
    }

    pub async fn unregister_service(&self, name: &str, id: &str) -> Result<()> {
        let registration = self.registrations.lock().await.remove(id);
        if let Some(registration) = registration {
            registration.keep_alive.stop();
        }
        let key = format!("{}/{}/{}", self.config.names_path, name, id);
        self.connector.delete_key(&key).await?;
        Ok(())
    }

    pub async fn query_for_names(&self) -> Result<Vec<String>> {
        let kvs = self.connector.list_prefix(&self.config.names_path).await?;
        let mut names: Vec<String> = Vec::new();
        for kv in kvs {
            let key = String::from_utf8_lossy(kv.key()).into_owned();
            if let Some(rest) = key.strip_prefix(&format!("{}/", self.config.names_path)) {
                if let Some((name, _)) = rest.split_once('/') {
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    pub async fn query_for_instances(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let prefix = format!("{}/{}/", self.config.names_path, name);
        let kvs = self.connector.list_prefix(&prefix).await?;
        kvs.iter()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(Error::from))
            .collect()
    }

    pub fn service_cache(&self, name: &str) -> Result<ServiceCache> {
        ServiceCache::new(self.connector.clone(), self.config.names_path.clone(), name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Added,
    Updated,
    Removed,
}

/// Notified by a [`ServiceCache`] whenever its local view of a service
/// changes. Errors are logged and do not stop the cache from dispatching to
/// the remaining listeners or from continuing to watch.
#[async_trait]
pub trait ServiceCacheListener: Send + Sync {
    async fn on_event(
        &self,
        event: CacheEvent,
        is_new: bool,
        service_name: &str,
        instance: Option<&ServiceInstance>,
    ) -> Result<()>;
}

struct CacheState {
    map: HashMap<String, ServiceInstance>,
    cancel: Option<CancellationToken>,
}

pub struct ServiceCache {
    connector: Connector,
    names_path: String,
    service_name: String,
    prefix: String,
    listeners: Arc<Mutex<Vec<Arc<dyn ServiceCacheListener>>>>,
    state: Arc<Mutex<CacheState>>,
}

impl ServiceCache {
    fn new(connector: Connector, names_path: String, service_name: String) -> Result<Self> {
        require_non_empty("service_name", &service_name)?;
        let prefix = format!("{names_path}/{service_name}/");
        Ok(Self {
            connector,
            names_path,
            service_name,
            prefix,
            listeners: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(CacheState {
                map: HashMap::new(),
                cancel: None,
            })),
        })
    }

    pub async fn add_listener(&self, listener: Arc<dyn ServiceCacheListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn get(&self, id: &str) -> Option<ServiceInstance> {
        self.state.lock().await.map.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<ServiceInstance> {
        self.state.lock().await.map.values().cloned().collect()
    }

    /// Seeds the local map from a range read, then spawns a background task
    /// that keeps it current from a prefix watch.
    pub async fn start(&self) -> Result<()> {
        let kvs = self.connector.list_prefix(&self.prefix).await?;
        {
            let mut state = self.state.lock().await;
            if state.cancel.is_some() {
                return Err(Error::IllegalState("service cache already started".to_string()));
            }
            for kv in &kvs {
                if let Ok(instance) = serde_json::from_slice::<ServiceInstance>(kv.value()) {
                    state.map.insert(instance.id.clone(), instance);
                }
            }
        }

        let cancel = CancellationToken::new();
        self.state.lock().await.cancel = Some(cancel.clone());

        let connector = self.connector.clone();
        let prefix = self.prefix.clone();
        let service_name = self.service_name.clone();
        let state = Arc::clone(&self.state);
        let listeners = Arc::clone(&self.listeners);
        tokio::spawn(async move {
            if let Err(e) = run_cache(connector, prefix, service_name, state, listeners, cancel).await {
                tracing::warn!(error = %e, "service cache watch ended");
            }
        });
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(cancel) = self.state.lock().await.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }
}

async fn run_cache(
    connector: Connector,
    prefix: String,
    service_name: String,
    state: Arc<Mutex<CacheState>>,
    listeners: Arc<Mutex<Vec<Arc<dyn ServiceCacheListener>>>>,
    cancel: CancellationToken,
) -> Result<()> {
    let (watcher, mut stream) = connector.watch(&prefix, true).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.message() => {
                match message? {
                    Some(resp) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            match event.event_type() {
                                EventType::Put => {
                                    let Ok(instance) = serde_json::from_slice::<ServiceInstance>(kv.value()) else {
                                        continue;
                                    };
                                    let is_new = {
                                        let mut guard = state.lock().await;
                                        let is_new = !guard.map.contains_key(&instance.id);
                                        guard.map.insert(instance.id.clone(), instance.clone());
                                        is_new
                                    };
                                    let event = if is_new { CacheEvent::Added } else { CacheEvent::Updated };
                                    dispatch(&listeners, event, is_new, &service_name, Some(&instance)).await;
                                }
                                EventType::Delete => {
                                    let id = kv_id(&prefix, kv.key());
                                    let removed = {
                                        let mut guard = state.lock().await;
                                        id.and_then(|id| guard.map.remove(&id))
                                    };
                                    dispatch(&listeners, CacheEvent::Removed, false, &service_name, removed.as_ref()).await;
                                }
                                _ => {}
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }
    cancel_watcher(watcher).await;
    Ok(())
}

fn kv_id(prefix: &str, key: &[u8]) -> Option<String> {
    std::str::from_utf8(key).ok()?.strip_prefix(prefix).map(str::to_string)
}

async fn dispatch(
    listeners: &Mutex<Vec<Arc<dyn ServiceCacheListener>>>,
    event: CacheEvent,
    is_new: bool,
    service_name: &str,
    instance: Option<&ServiceInstance>,
) {
    let listeners = listeners.lock().await.clone();
    for listener in listeners {
        if let Err(e) = listener.on_event(event, is_new, service_name, instance).await {
            tracing::error!(service_name, error = %e, "service cache listener failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            name: "orders".to_string(),
            json_payload: "{}".to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            ssl_port: 8443,
            registration_time_utc: 0,
            service_type: ServiceType::Dynamic,
            uri: "http://10.0.0.1:8080".to_string(),
            enabled: true,
            id: id.to_string(),
        }
    }

    #[test]
    fn service_instance_round_trips_through_json() {
        let instance = sample_instance("abc");
        let json = serde_json::to_string(&instance).expect("serialize");
        let parsed: ServiceInstance = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, instance);
    }

    #[test]
    fn rejects_empty_names_path() {
        let config = ServiceDiscoveryConfig::default();
        assert!(require_non_empty("names_path", &config.names_path).is_err());
    }

    #[test]
    fn kv_id_strips_prefix() {
        assert_eq!(kv_id("/names/orders/", b"/names/orders/abc"), Some("abc".to_string()));
        assert_eq!(kv_id("/names/orders/", b"/names/other/abc"), None);
    }
}
