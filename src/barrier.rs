//! Single-key distributed barrier: one process "sets" the barrier, and any
//! number of others block until it is removed (explicitly, or via lease
//! expiry if the setter dies).

use std::time::Duration;

use etcd_client::{Compare, CompareOp, EventType, TxnOp};
use tokio::sync::Mutex;

use crate::connector::{Connector, KeepAliveHandle};
use crate::error::Result;
use crate::util::{require_non_empty, unique_token};

#[derive(Debug, Clone)]
pub struct BarrierConfig {
    pub client_id: String,
    pub barrier_path: String,
    pub lease_ttl_secs: i64,
    pub keep_alive_interval: Duration,
    /// If `false`, `wait_on_barrier` returns `true` immediately when the
    /// barrier key is already absent rather than waiting for a DELETE that
    /// will never come.
    pub wait_on_missing_barriers: bool,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            barrier_path: String::new(),
            lease_ttl_secs: 2,
            keep_alive_interval: Duration::from_millis(600),
            wait_on_missing_barriers: true,
        }
    }
}

struct BarrierState {
    keep_alive: Option<KeepAliveHandle>,
    removed: bool,
}

pub struct DistributedBarrier {
    connector: Connector,
    config: BarrierConfig,
    state: Mutex<BarrierState>,
}

impl DistributedBarrier {
    pub fn new(connector: Connector, config: BarrierConfig) -> Result<Self> {
        require_non_empty("barrier_path", &config.barrier_path)?;
        Ok(Self {
            connector,
            config,
            state: Mutex::new(BarrierState {
                keep_alive: None,
                removed: false,
            }),
        })
    }

    pub async fn is_barrier_set(&self) -> Result<bool> {
        self.connector.is_key_present(&self.config.barrier_path).await
    }

    /// Returns `false` if the barrier is already set; otherwise grants a
    /// lease, writes the key under it, reads the value back to confirm this
    /// instance actually won the race, and starts the keep-alive.
    pub async fn set_barrier(&self) -> Result<bool> {
        let token = unique_token(&self.config.client_id);
        let lease_id = self.connector.lease_grant(self.config.lease_ttl_secs).await?;

        let resp = self
            .connector
            .cas(
                vec![Compare::version(self.config.barrier_path.as_str(), CompareOp::Equal, 0)],
                vec![TxnOp::put(
                    self.config.barrier_path.as_str(),
                    token.as_bytes().to_vec(),
                    Some(etcd_client::PutOptions::new().with_lease(lease_id)),
                )],
                vec![TxnOp::get(self.config.barrier_path.as_str(), None)],
            )
            .await?;

        if !resp.succeeded() {
            drop(self.connector.lease_revoke(lease_id).await);
            return Ok(false);
        }

        match self.connector.get_value(&self.config.barrier_path).await? {
            Some(value) if value == token.as_bytes() => {
                let keep_alive = self
                    .connector
                    .keep_alive(lease_id, self.config.keep_alive_interval)?;
                self.state.lock().await.keep_alive = Some(keep_alive);
                Ok(true)
            }
            // Lost a race we thought we'd won: another client's write
            // landed in between our CAS and the read-back. Don't delete —
            // that key might belong to the actual winner now. Our lease
            // carries no live key, so it expires untouched.
            _ => Ok(false),
        }
    }

    /// `false` if this instance already removed the barrier; otherwise
    /// stops the keep-alive and deletes the key for promptness (rather than
    /// waiting out the TTL).
    pub async fn remove_barrier(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.removed {
            return Ok(false);
        }
        state.removed = true;
        let keep_alive = state.keep_alive.take();
        drop(state);

        if let Some(keep_alive) = keep_alive {
            keep_alive.stop();
        }
        self.connector.delete_key(&self.config.barrier_path).await?;
        Ok(true)
    }

    /// Blocks until the barrier is removed or `timeout` elapses. Returns
    /// `true` if released, `false` on timeout.
    pub async fn wait_on_barrier(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.config.wait_on_missing_barriers && !self.is_barrier_set().await? {
            return Ok(true);
        }

        self.connector
            .with_watcher(&self.config.barrier_path, false, |mut stream| async move {
                // TOCTOU guard: the barrier may have been removed between
                // the check above and the watch being armed.
                if !self.is_barrier_set().await? {
                    return Ok(true);
                }

                let wait = async {
                    loop {
                        match stream.message().await? {
                            Some(resp)
                                if resp
                                    .events()
                                    .iter()
                                    .any(|e| e.event_type() == EventType::Delete) =>
                            {
                                return Ok(true);
                            }
                            Some(_) => continue,
                            None => return Ok(false),
                        }
                    }
                };

                match timeout {
                    Some(d) => Ok(tokio::time::timeout(d, wait)
                        .await
                        .unwrap_or(Ok(false))?),
                    None => wait.await,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_barrier_path() {
        let config = BarrierConfig {
            barrier_path: String::new(),
            ..Default::default()
        };
        assert!(require_non_empty("barrier_path", &config.barrier_path).is_err());
    }

    #[test]
    fn default_ttl_is_two_seconds() {
        assert_eq!(BarrierConfig::default().lease_ttl_secs, 2);
    }
}
