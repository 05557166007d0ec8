use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{
    Client, Compare, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp, TxnResponse, WatchOptions,
    WatchStream, Watcher,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub endpoints: Vec<String>,
}

/// Owns the etcd client and the bookkeeping needed to tear everything it
/// spawned down in a fixed order on close: keep-alives, then watches, then
/// leases, then KV, then the underlying client.
///
/// `Client` is itself `Clone` (it wraps an inner `Arc`), so handing a clone
/// to every recipe is cheap; what the Connector adds on top is close-once
/// semantics and the scoped `with_watcher`/`keep_alive` helpers recipes
/// build on. Each recipe in turn owns the specific watcher and keep-alive it
/// asks the Connector for, and is responsible for releasing them (via the
/// same ordering) in its own `close`.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    closed: AtomicBool,
    keep_alives: Mutex<Vec<CancellationToken>>,
    leases: Mutex<Vec<i64>>,
}

/// Handle to a running lease keep-alive task. Dropping it (or calling
/// `stop`) cancels the task; the lease then expires naturally within its
/// TTL, deleting any keys bound to it.
pub struct KeepAliveHandle {
    lease_id: i64,
    token: CancellationToken,
}

impl KeepAliveHandle {
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Stop sending keep-alive pings. The lease is not explicitly revoked;
    /// it will lapse on its own once the TTL elapses.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Connector {
    pub async fn connect(config: ConnectorConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self::new(client))
    }

    pub(crate) fn new(client: Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                closed: AtomicBool::new(false),
                keep_alives: Mutex::new(Vec::new()),
                leases: Mutex::new(Vec::new()),
            }),
        }
    }

    #[cfg(test)]
    pub fn from_client(client: Client) -> Self {
        Self::new(client)
    }

    fn client(&self) -> Client {
        self.inner.client.clone()
    }

    pub fn check_not_closed(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    // ── KV helpers ───────────────────────────────────────────────

    pub async fn is_key_present(&self, key: &str) -> Result<bool> {
        self.check_not_closed()?;
        let resp = self
            .client()
            .get(key, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_not_closed()?;
        let resp = self.client().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    pub async fn get_kv(&self, key: &str) -> Result<Option<etcd_client::KeyValue>> {
        self.check_not_closed()?;
        let resp = self.client().get(key, None).await?;
        Ok(resp.kvs().first().cloned())
    }

    /// Like `get_kv`, but also returns the store's current revision as seen
    /// by this read (`header.revision`), independent of whether `key`
    /// itself exists. Used by the queue's sentinel-based serialization.
    pub async fn get_kv_with_revision(&self, key: &str) -> Result<(Option<etcd_client::KeyValue>, i64)> {
        self.check_not_closed()?;
        let resp = self.client().get(key, None).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok((resp.kvs().first().cloned(), revision))
    }

    /// Lists the range under `prefix`, ascending by key (etcd's default
    /// range order).
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<etcd_client::KeyValue>> {
        self.check_not_closed()?;
        let resp = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp.kvs().to_vec())
    }

    pub async fn count_prefix(&self, prefix: &str) -> Result<i64> {
        self.check_not_closed()?;
        let resp = self
            .client()
            .get(
                prefix,
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await?;
        Ok(resp.count())
    }

    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        lease_id: Option<i64>,
    ) -> Result<i64> {
        self.check_not_closed()?;
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let resp = self.client().put(key, value, options).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    pub async fn delete_key(&self, key: &str) -> Result<i64> {
        self.check_not_closed()?;
        let resp = self.client().delete(key, None).await?;
        Ok(resp.deleted())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        self.check_not_closed()?;
        let resp = self
            .client()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(resp.deleted())
    }

    // ── Transactions ─────────────────────────────────────────────

    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.check_not_closed()?;
        Ok(self.client().txn(txn).await?)
    }

    /// `when(compares) and_then(then_ops) or_else(else_ops)`.
    pub async fn cas(
        &self,
        compares: Vec<Compare>,
        then_ops: Vec<TxnOp>,
        else_ops: Vec<TxnOp>,
    ) -> Result<TxnResponse> {
        let txn = Txn::new().when(compares).and_then(then_ops).or_else(else_ops);
        self.txn(txn).await
    }

    // ── Leases ───────────────────────────────────────────────────

    pub async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
        self.check_not_closed()?;
        let resp = self.client().lease_grant(ttl_secs, None).await?;
        let id = resp.id();
        self.inner.leases.lock().await.push(id);
        Ok(id)
    }

    pub async fn lease_revoke(&self, lease_id: i64) -> Result<()> {
        self.client().lease_revoke(lease_id).await?;
        self.inner.leases.lock().await.retain(|id| *id != lease_id);
        Ok(())
    }

    /// Spawns a background task that pings the lease at `interval` until the
    /// returned handle is stopped or dropped. Mirrors the keep-alive loop
    /// used for leader-election leases: a stream error or a closed stream
    /// ends the task, letting the lease lapse.
    pub fn keep_alive(&self, lease_id: i64, interval: Duration) -> Result<KeepAliveHandle> {
        self.check_not_closed()?;
        let token = CancellationToken::new();
        let handle = KeepAliveHandle {
            lease_id,
            token: token.clone(),
        };
        let inner = Arc::clone(&self.inner);
        let task_token = token.clone();
        tokio::spawn(async move {
            inner.keep_alives.lock().await.push(task_token.clone());
            let client = inner.client.clone();
            // Stale tokens (tasks that already finished) are harmless to
            // cancel again when `close` drains this list later.
            if let Err(e) = run_keep_alive(client, lease_id, interval, task_token).await {
                tracing::warn!(lease_id, error = %e, "lease keep-alive ended");
            }
        });
        Ok(handle)
    }

    // ── Watches ──────────────────────────────────────────────────

    async fn watch_raw(&self, key: &str, prefix: bool) -> Result<(Watcher, WatchStream)> {
        self.check_not_closed()?;
        let options = if prefix {
            Some(WatchOptions::new().with_prefix())
        } else {
            None
        };
        let (watcher, stream) = self.client().watch(key, options).await?;
        Ok((watcher, stream))
    }

    /// Scoped watcher acquisition: installs a watch on `key` (or its
    /// prefix), runs `body` with the resulting stream, and cancels the
    /// watch on every exit path from `body` — success, error, or panic.
    pub async fn with_watcher<F, Fut, T>(&self, key: &str, prefix: bool, body: F) -> Result<T>
    where
        F: FnOnce(WatchStream) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (watcher, stream) = self.watch_raw(key, prefix).await?;
        let guard = WatcherGuard::new(watcher);
        let result = body(stream).await;
        guard.cancel().await;
        result
    }

    /// Long-running watcher acquisition for background workers (e.g. the
    /// leader selector's re-contend loop, or a queue's dequeue waiter). The
    /// caller owns the returned `Watcher` and must cancel it itself (via
    /// `cancel_watcher`) when its own `close` runs.
    pub async fn watch(&self, key: &str, prefix: bool) -> Result<(Watcher, WatchStream)> {
        self.watch_raw(key, prefix).await
    }

    // ── Close ────────────────────────────────────────────────────

    /// Tears down everything the Connector spawned — outstanding keep-alive
    /// tasks and leases it granted — then drops its reference to the
    /// underlying client. Idempotent: the second and later calls are
    /// no-ops. Best-effort: a failure tearing down one resource is logged
    /// but does not stop the rest from closing.
    pub async fn close(&self) -> Result<()> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        for token in self.inner.keep_alives.lock().await.drain(..) {
            token.cancel();
        }

        for lease_id in self.inner.leases.lock().await.drain(..) {
            if let Err(e) = self.client().lease_revoke(lease_id).await {
                tracing::warn!(lease_id, error = %e, "failed to revoke lease during close");
            }
        }

        // KV access and the root client have no explicit teardown beyond
        // dropping the last clone of `Client`, which happens when this
        // Connector's final `Arc` reference is released.
        Ok(())
    }
}

/// Cancels a watcher obtained from `Connector::watch`, logging (not
/// propagating) any failure — watch teardown is always best-effort.
pub async fn cancel_watcher(mut watcher: Watcher) {
    if let Err(e) = watcher.cancel().await {
        tracing::warn!(error = %e, "failed to cancel watcher");
    }
}

/// Guards a scoped watcher so it is cancelled even if the body driving it
/// panics mid-await. The normal exit path calls `cancel` directly (an async
/// RPC); the panic path runs `Drop`, which can't await, so it hands the
/// cancellation off to a spawned task instead.
struct WatcherGuard {
    watcher: Option<Watcher>,
}

impl WatcherGuard {
    fn new(watcher: Watcher) -> Self {
        Self { watcher: Some(watcher) }
    }

    async fn cancel(mut self) {
        if let Some(watcher) = self.watcher.take() {
            cancel_watcher(watcher).await;
        }
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            tokio::spawn(async move {
                cancel_watcher(watcher).await;
            });
        }
    }
}

async fn run_keep_alive(
    mut client: Client,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                if stream.message().await?.is_none() {
                    return Err(Error::StoreUnavailable(format!(
                        "lease {lease_id} keep-alive stream closed"
                    )));
                }
            }
        }
    }
}
