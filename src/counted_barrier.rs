//! N-party rendezvous: all `member_count` waiters must call `wait_on_barrier`
//! before any of them return `true`.

use std::time::Duration;

use etcd_client::{Compare, CompareOp, EventType, TxnOp};
use tokio::sync::Mutex;

use crate::connector::{Connector, KeepAliveHandle};
use crate::error::{Error, Result};
use crate::util::{require_non_empty, require_positive, unique_token};

#[derive(Debug, Clone)]
pub struct CountedBarrierConfig {
    pub client_id: String,
    pub barrier_path: String,
    pub member_count: u32,
    pub lease_ttl_secs: i64,
    pub keep_alive_interval: Duration,
}

impl Default for CountedBarrierConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            barrier_path: String::new(),
            member_count: 1,
            lease_ttl_secs: 2,
            keep_alive_interval: Duration::from_millis(600),
        }
    }
}

struct State {
    keep_alive: Option<KeepAliveHandle>,
}

pub struct CountedBarrier {
    connector: Connector,
    config: CountedBarrierConfig,
    ready_path: String,
    waiting_prefix: String,
    state: Mutex<State>,
}

impl CountedBarrier {
    pub fn new(connector: Connector, config: CountedBarrierConfig) -> Result<Self> {
        require_non_empty("barrier_path", &config.barrier_path)?;
        require_positive("member_count", config.member_count)?;
        let ready_path = format!("{}/ready", config.barrier_path);
        let waiting_prefix = format!("{}/waiting/", config.barrier_path);
        Ok(Self {
            connector,
            config,
            ready_path,
            waiting_prefix,
            state: Mutex::new(State { keep_alive: None }),
        })
    }

    /// Blocks until `member_count` distinct waiters have all called this
    /// method, or `timeout` elapses. Returns `false` on timeout.
    pub async fn wait_on_barrier(&self, timeout: Option<Duration>) -> Result<bool> {
        let token = unique_token(&self.config.client_id);
        let waiter_path = format!("{}{}", self.waiting_prefix, token);

        // Harmless if this loses the race: whichever waiter's PUT actually
        // lands first owns `ready` for the whole cohort.
        drop(
            self.connector
                .cas(
                    vec![Compare::version(self.ready_path.as_str(), CompareOp::Equal, 0)],
                    vec![TxnOp::put(self.ready_path.as_str(), token.as_bytes().to_vec(), None)],
                    vec![],
                )
                .await?,
        );

        let lease_id = self.connector.lease_grant(self.config.lease_ttl_secs).await?;
        let resp = self
            .connector
            .cas(
                vec![Compare::version(waiter_path.as_str(), CompareOp::Equal, 0)],
                vec![TxnOp::put(
                    waiter_path.as_str(),
                    token.as_bytes().to_vec(),
                    Some(etcd_client::PutOptions::new().with_lease(lease_id)),
                )],
                vec![TxnOp::get(waiter_path.as_str(), None)],
            )
            .await?;

        if !resp.succeeded() {
            return Err(Error::IllegalState(format!(
                "waiter key {waiter_path} was already present"
            )));
        }
        match self.connector.get_value(&waiter_path).await? {
            Some(value) if value == token.as_bytes() => {}
            _ => {
                return Err(Error::IllegalState(format!(
                    "failed to confirm waiter key {waiter_path} after write"
                )))
            }
        }

        let keep_alive = self.connector.keep_alive(lease_id, self.config.keep_alive_interval)?;
        self.state.lock().await.keep_alive = Some(keep_alive);

        let released = self.run_wait(timeout).await?;

        {
            let mut state = self.state.lock().await;
            if let Some(keep_alive) = state.keep_alive.take() {
                keep_alive.stop();
            }
        }
        if !released {
            // Timed out: don't wait out the TTL, clean up promptly so the
            // count drops for anyone still waiting.
            drop(self.connector.delete_key(&waiter_path).await);
        }
        Ok(released)
    }

    async fn run_wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.check_waiter_count().await? {
            return Ok(true);
        }

        let wait_body = async {
            self.connector
                .with_watcher(&self.config.barrier_path, true, |mut stream| async move {
                    // Races the watch arming against a concurrent release.
                    if self.check_waiter_count().await? {
                        return Ok(true);
                    }
                    loop {
                        match stream.message().await? {
                            Some(resp) => {
                                let mut released = false;
                                for event in resp.events() {
                                    let Some(kv) = event.kv() else { continue };
                                    let key = String::from_utf8_lossy(kv.key());
                                    match event.event_type() {
                                        EventType::Put if key.starts_with(&self.waiting_prefix) => {
                                            if self.check_waiter_count().await? {
                                                released = true;
                                            }
                                        }
                                        EventType::Delete if key == self.ready_path => {
                                            released = true;
                                        }
                                        _ => {}
                                    }
                                }
                                if released {
                                    return Ok(true);
                                }
                            }
                            None => return Ok(false),
                        }
                    }
                })
                .await
        };

        match timeout {
            Some(d) => Ok(tokio::time::timeout(d, wait_body).await.unwrap_or(Ok(false))?),
            None => wait_body.await,
        }
    }

    /// If `ready` is already gone, the cohort already released. Otherwise
    /// counts `waiting/` children; on reaching `member_count`, deletes
    /// `ready` to broadcast release to every other watcher.
    async fn check_waiter_count(&self) -> Result<bool> {
        if !self.connector.is_key_present(&self.ready_path).await? {
            return Ok(true);
        }
        let count = self.connector.count_prefix(&self.waiting_prefix).await?;
        if count < self.config.member_count as i64 {
            return Ok(false);
        }
        let resp = self
            .connector
            .cas(
                vec![Compare::version(self.ready_path.as_str(), CompareOp::NotEqual, 0)],
                vec![TxnOp::delete(self.ready_path.as_str(), None)],
                vec![],
            )
            .await?;
        // Whether or not this instance's delete wins, the count threshold
        // was reached: the cohort has released.
        let _ = resp.succeeded();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_member_count() {
        let config = CountedBarrierConfig {
            barrier_path: "/barrier".to_string(),
            member_count: 0,
            ..Default::default()
        };
        assert!(require_positive("member_count", config.member_count).is_err());
    }

    #[test]
    fn rejects_empty_barrier_path() {
        let config = CountedBarrierConfig::default();
        assert!(require_non_empty("barrier_path", &config.barrier_path).is_err());
    }
}
