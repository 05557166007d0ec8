//! FIFO and priority queues built on sequentially-numbered keys under a
//! shared prefix, serialized by a sentinel key whose modRevision acts as an
//! optimistic lock over the whole prefix.

use std::time::Duration;

use etcd_client::{Compare, CompareOp, EventType, TxnOp};

use crate::connector::Connector;
use crate::error::Result;
use crate::util::{format_priority, format_seq, require_non_empty};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_path: String,
}

pub struct FifoQueue {
    connector: Connector,
    config: QueueConfig,
}

impl FifoQueue {
    pub fn new(connector: Connector, config: QueueConfig) -> Result<Self> {
        require_non_empty("queue_path", &config.queue_path)?;
        Ok(Self { connector, config })
    }

    pub async fn enqueue(&self, value: impl Into<Vec<u8>>) -> Result<()> {
        enqueue_at(&self.connector, &self.config.queue_path, value.into()).await
    }

    /// Blocks until an element is available or `timeout` elapses.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        dequeue_at(&self.connector, &self.config.queue_path, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct PriorityQueueConfig {
    pub queue_path: String,
}

pub struct PriorityQueue {
    connector: Connector,
    config: PriorityQueueConfig,
}

impl PriorityQueue {
    pub fn new(connector: Connector, config: PriorityQueueConfig) -> Result<Self> {
        require_non_empty("queue_path", &config.queue_path)?;
        Ok(Self { connector, config })
    }

    /// Lower `priority` values are dequeued first.
    pub async fn enqueue(&self, value: impl Into<Vec<u8>>, priority: u32) -> Result<()> {
        let prefix = format!("{}/{}", self.config.queue_path, format_priority(priority));
        enqueue_at(&self.connector, &prefix, value.into()).await
    }

    /// Blocks until an element is available or `timeout` elapses. Scans the
    /// whole queue path: because the priority segment is fixed-width and
    /// sorts ahead of the sequence segment, the lexicographically smallest
    /// key is always the highest-priority, oldest element.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        dequeue_at(&self.connector, &self.config.queue_path, timeout).await
    }
}

fn parse_seq(prefix: &str, key: &[u8]) -> Option<u64> {
    let key = std::str::from_utf8(key).ok()?;
    let suffix = key.strip_prefix(prefix)?.trim_start_matches('/');
    // A priority queue's full `queue_path` prefix also contains the
    // `<priority>/<seq>` segments; only the FIFO per-bucket form (a single
    // numeric segment) is a direct sequence number.
    suffix.parse::<u64>().ok()
}

/// Allocates the next sequence number under `prefix` and writes `value`
/// there, advancing the `__<prefix>` sentinel in the same transaction.
/// Retries on contention: a concurrent enqueuer's successful transaction
/// moves the sentinel's modRevision past what we last observed.
async fn enqueue_at(connector: &Connector, prefix: &str, value: Vec<u8>) -> Result<()> {
    loop {
        let children = connector.list_prefix(prefix).await?;
        let last_seq = children
            .last()
            .and_then(|kv| parse_seq(prefix, kv.key()));
        let new_seq = last_seq.map(|s| s + 1).unwrap_or(0);

        let sentinel_key = format!("__{prefix}");
        let (_, header_revision) = connector.get_kv_with_revision(&sentinel_key).await?;

        let new_key = format!("{prefix}/{}", format_seq(new_seq));
        let resp = connector
            .cas(
                vec![Compare::mod_revision(
                    sentinel_key.as_str(),
                    CompareOp::Less,
                    header_revision + 1,
                )],
                vec![
                    TxnOp::put(sentinel_key.as_str(), Vec::new(), None),
                    TxnOp::put(new_key.as_str(), value.clone(), None),
                ],
                vec![],
            )
            .await?;

        if resp.succeeded() {
            return Ok(());
        }
        // A racing enqueuer advanced the sentinel between our read and our
        // transaction; re-read and retry with a fresh sequence number.
    }
}

/// Removes and returns the lexicographically smallest child of `prefix`.
/// Blocks (watching for PUTs) while the prefix is empty, up to `timeout`.
async fn dequeue_at(
    connector: &Connector,
    prefix: &str,
    timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>> {
    let deadline = timeout.map(|d| tokio::time::Instant::now() + d);

    loop {
        let children = connector.list_prefix(prefix).await?;
        // The sentinel lives at `__<prefix>`, outside this range (it never
        // starts with `prefix`'s bytes), so every child here is real data.
        let Some(kv) = children.into_iter().next() else {
            if !wait_for_arrival(connector, prefix, deadline).await? {
                return Ok(None);
            }
            continue;
        };

        let key = String::from_utf8_lossy(kv.key()).into_owned();
        let resp = connector
            .cas(
                vec![Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision())],
                vec![TxnOp::delete(key.as_str(), None)],
                vec![],
            )
            .await?;

        if resp.succeeded() {
            return Ok(Some(kv.value().to_vec()));
        }
        // Another consumer deleted it first; retry with a fresh read.
    }
}

/// Waits for a PUT under `prefix`, or for `deadline` to pass. Returns
/// `false` on timeout (candidate for the caller to stop retrying).
async fn wait_for_arrival(
    connector: &Connector,
    prefix: &str,
    deadline: Option<tokio::time::Instant>,
) -> Result<bool> {
    connector
        .with_watcher(prefix, true, |mut stream| async move {
            let wait = async {
                loop {
                    match stream.message().await? {
                        Some(resp) if resp.events().iter().any(|e| e.event_type() == EventType::Put) => {
                            return Ok(true);
                        }
                        Some(_) => continue,
                        None => return Ok(false),
                    }
                }
            };
            match deadline {
                Some(d) => Ok(tokio::time::timeout_at(d, wait).await.unwrap_or(Ok(false))?),
                None => wait.await,
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_queue_path() {
        let config = QueueConfig { queue_path: String::new() };
        assert!(require_non_empty("queue_path", &config.queue_path).is_err());
    }

    #[test]
    fn parse_seq_reads_fixed_width_suffix() {
        let prefix = "/queue/a";
        let key = format!("{prefix}/{}", format_seq(7));
        assert_eq!(parse_seq(prefix, key.as_bytes()), Some(7));
    }

    #[test]
    fn parse_seq_rejects_non_numeric_suffix() {
        assert_eq!(parse_seq("/queue/a", b"/queue/a/not-a-number"), None);
    }

    #[test]
    fn priority_and_seq_segments_sort_by_priority_then_age() {
        let high = format!("{}/{}", format_priority(1), format_seq(100));
        let low = format!("{}/{}", format_priority(5), format_seq(0));
        assert!(high < low);
    }
}
