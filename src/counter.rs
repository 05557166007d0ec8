//! Distributed atomic counter: a single etcd key holding an 8-byte
//! big-endian `i64`, mutated via optimistic CAS-retry rather than any
//! server-side atomic add.

use std::time::Duration;

use etcd_client::{Compare, CompareOp, TxnOp};
use tokio_util::sync::CancellationToken;

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::util::{cas_backoff, require_non_empty};

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub counter_path: String,
    /// Base used to compute the randomized backoff between CAS retries:
    /// see [`crate::util::cas_backoff`].
    pub retry_backoff_base: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            counter_path: String::new(),
            retry_backoff_base: Duration::from_millis(20),
        }
    }
}

pub struct AtomicCounter {
    connector: Connector,
    config: CounterConfig,
}

/// Snapshot of the key backing a counter: either it doesn't exist yet (reads
/// as zero, created on first write) or it holds a value at some mod revision.
enum Snapshot {
    Absent,
    Present { value: i64, mod_revision: i64 },
}

impl AtomicCounter {
    pub fn new(connector: Connector, config: CounterConfig) -> Result<Self> {
        require_non_empty("counter_path", &config.counter_path)?;
        Ok(Self { connector, config })
    }

    /// Current value, or `0` if the key has never been written.
    pub async fn get(&self) -> Result<i64> {
        match self.read().await? {
            Snapshot::Absent => Ok(0),
            Snapshot::Present { value, .. } => Ok(value),
        }
    }

    pub async fn increment(&self, cancel: Option<&CancellationToken>) -> Result<i64> {
        self.add(1, cancel).await
    }

    pub async fn decrement(&self, cancel: Option<&CancellationToken>) -> Result<i64> {
        self.add(-1, cancel).await
    }

    pub async fn subtract(&self, delta: i64, cancel: Option<&CancellationToken>) -> Result<i64> {
        self.add(-delta, cancel).await
    }

    /// Adds `delta` (possibly negative) to the counter and returns the new
    /// value. Retries under contention with randomized backoff until it
    /// succeeds or `cancel` fires.
    pub async fn add(&self, delta: i64, cancel: Option<&CancellationToken>) -> Result<i64> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(Error::Interrupted);
                }
            }

            let snapshot = self.read().await?;
            let (current, compare) = match snapshot {
                Snapshot::Absent => (0i64, Compare::version(self.config.counter_path.as_str(), CompareOp::Equal, 0)),
                Snapshot::Present { value, mod_revision } => (
                    value,
                    Compare::mod_revision(self.config.counter_path.as_str(), CompareOp::Equal, mod_revision),
                ),
            };
            let new_value = current + delta;

            let resp = self
                .connector
                .cas(
                    vec![compare],
                    vec![TxnOp::put(
                        self.config.counter_path.as_str(),
                        new_value.to_be_bytes().to_vec(),
                        None,
                    )],
                    vec![TxnOp::get(self.config.counter_path.as_str(), None)],
                )
                .await?;

            if resp.succeeded() {
                return Ok(new_value);
            }

            attempt += 1;
            let backoff = cas_backoff(attempt, self.config.retry_backoff_base);
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Interrupted),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                None => tokio::time::sleep(backoff).await,
            }
        }
    }

    /// Unconditionally overwrites the counter, bypassing the CAS loop.
    pub async fn force_set(&self, new_value: i64) -> Result<()> {
        self.connector
            .put(&self.config.counter_path, new_value.to_be_bytes().to_vec(), None)
            .await?;
        Ok(())
    }

    /// Atomically sets the counter to `new_value` only if its current value
    /// is `expected_value`. Returns whether the swap happened.
    pub async fn compare_and_set(&self, expected_value: i64, new_value: i64) -> Result<bool> {
        let snapshot = self.read().await?;
        let (current, compare) = match snapshot {
            Snapshot::Absent => (0i64, Compare::version(self.config.counter_path.as_str(), CompareOp::Equal, 0)),
            Snapshot::Present { value, mod_revision } => (
                value,
                Compare::mod_revision(self.config.counter_path.as_str(), CompareOp::Equal, mod_revision),
            ),
        };
        if current != expected_value {
            return Ok(false);
        }
        let resp = self
            .connector
            .cas(
                vec![compare],
                vec![TxnOp::put(
                    self.config.counter_path.as_str(),
                    new_value.to_be_bytes().to_vec(),
                    None,
                )],
                vec![],
            )
            .await?;
        Ok(resp.succeeded())
    }

    async fn read(&self) -> Result<Snapshot> {
        match self.connector.get_kv(&self.config.counter_path).await? {
            None => Ok(Snapshot::Absent),
            Some(kv) => {
                let bytes: [u8; 8] = kv.value().try_into().map_err(|_| {
                    Error::IllegalState(format!(
                        "counter at {} is not an 8-byte big-endian int64",
                        self.config.counter_path
                    ))
                })?;
                Ok(Snapshot::Present {
                    value: i64::from_be_bytes(bytes),
                    mod_revision: kv.mod_revision(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_counter_path() {
        let config = CounterConfig::default();
        assert!(require_non_empty("counter_path", &config.counter_path).is_err());
    }

    #[test]
    fn default_backoff_base_is_twenty_millis() {
        assert_eq!(CounterConfig::default().retry_backoff_base, Duration::from_millis(20));
    }
}
