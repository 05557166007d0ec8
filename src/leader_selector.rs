//! Single-winner leader election with automatic re-contention and graceful
//! relinquishment, built on [`Connector`].
//!
//! Mirrors the CAS-then-keepalive shape of a plain etcd leader-election
//! loop, but packages it as a re-usable recipe object with an explicit
//! `Idle -> Starting -> Contending -> Leading -> Relinquished -> Idle` state
//! machine instead of a single free function.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, TxnOp};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::connector::{cancel_watcher, Connector};
use crate::error::{Error, Result};
use crate::util::{require_non_empty, unique_token};

#[derive(Debug, Clone)]
pub struct LeaderSelectorConfig {
    /// Identifier for this candidate (e.g. host:pid).
    pub client_id: String,
    /// etcd key where the leader record is stored.
    pub election_path: String,
    /// TTL for the leader lease. If the leader dies, the key expires after this.
    pub lease_ttl_secs: i64,
    /// How often to send keepalive pings while leading.
    pub keep_alive_interval: Duration,
    /// How long to wait for a DELETE event before re-attempting acquisition.
    pub retry_interval: Duration,
}

impl Default for LeaderSelectorConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            election_path: String::new(),
            lease_ttl_secs: 2,
            keep_alive_interval: Duration::from_millis(600),
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Contending,
    Leading,
    Relinquished,
}

/// User hook invoked while this instance holds leadership.
///
/// `take_leadership` receives a [`CancellationToken`] that fires when
/// `close()` is called on the [`LeaderSelector`]; cooperative listeners
/// should stop their work and return when it fires. `relinquish_leadership`
/// runs immediately afterward, once the keep-alive has been stopped.
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    async fn take_leadership(&self, cancel: CancellationToken);

    async fn relinquish_leadership(&self) {}
}

struct SelectorState {
    phase: Phase,
    active: bool,
    closed: bool,
    worker_cancel: Option<CancellationToken>,
    complete_notify: Option<Arc<Notify>>,
}

#[derive(Clone)]
pub struct LeaderSelector {
    connector: Connector,
    config: LeaderSelectorConfig,
    listener: Arc<dyn LeadershipListener>,
    state: Arc<Mutex<SelectorState>>,
}

impl LeaderSelector {
    pub fn new(
        connector: Connector,
        config: LeaderSelectorConfig,
        listener: Arc<dyn LeadershipListener>,
    ) -> Result<Self> {
        require_non_empty("election_path", &config.election_path)?;
        Ok(Self {
            connector,
            config,
            listener,
            state: Arc::new(Mutex::new(SelectorState {
                phase: Phase::Idle,
                active: false,
                closed: false,
                worker_cancel: None,
                complete_notify: None,
            })),
        })
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn is_leader(&self) -> bool {
        self.phase().await == Phase::Leading
    }

    /// Launches a background worker that contends for leadership, runs the
    /// listener's `take_leadership` once elected, and relinquishes when it
    /// returns. Legal only from `Idle`; the guard flips back to allow
    /// another `start()` once the cycle fully completes.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        if state.active {
            return Err(Error::IllegalState(
                "start called while a previous election cycle is active".to_string(),
            ));
        }
        state.active = true;
        state.phase = Phase::Starting;
        let cancel = CancellationToken::new();
        state.worker_cancel = Some(cancel.clone());
        let notify = Arc::new(Notify::new());
        state.complete_notify = Some(Arc::clone(&notify));
        drop(state);

        let connector = self.connector.clone();
        let config = self.config.clone();
        let listener = Arc::clone(&self.listener);
        let state_arc = Arc::clone(&self.state);
        tokio::spawn(run_cycle(connector, config, listener, cancel, notify, state_arc));
        Ok(())
    }

    /// Blocks until the election cycle started by `start()` fully completes
    /// (elected, ran the listener, and relinquished), or the timeout
    /// elapses. Returns `false` on timeout. Must be called after `start()`.
    pub async fn wait_on_leadership_complete(&self, timeout: Option<Duration>) -> Result<bool> {
        let notify = {
            let state = self.state.lock().await;
            state
                .complete_notify
                .clone()
                .ok_or_else(|| {
                    Error::IllegalState("wait_on_leadership_complete called before start".to_string())
                })?
        };
        match timeout {
            Some(d) => Ok(tokio::time::timeout(d, notify.notified()).await.is_ok()),
            None => {
                notify.notified().await;
                Ok(true)
            }
        }
    }

    /// Idempotent. Cancels the in-flight worker (if any), which stops its
    /// keep-alive and releases `wait_on_leadership_complete` waiters, and
    /// marks the instance closed so further calls fail fast.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(cancel) = state.worker_cancel.take() {
            cancel.cancel();
        }
        if let Some(notify) = state.complete_notify.take() {
            notify.notify_waiters();
        }
        Ok(())
    }
}

async fn run_cycle(
    connector: Connector,
    config: LeaderSelectorConfig,
    listener: Arc<dyn LeadershipListener>,
    cancel: CancellationToken,
    complete_notify: Arc<Notify>,
    state: Arc<Mutex<SelectorState>>,
) {
    set_phase(&state, Phase::Contending).await;

    let acquired = tokio::select! {
        _ = cancel.cancelled() => None,
        result = acquire_leadership(&connector, &config, &cancel) => {
            match result {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::warn!(election_path = %config.election_path, error = %e, "leader acquisition failed");
                    None
                }
            }
        }
    };

    if let Some((token, lease_id)) = acquired {
        match connector.keep_alive(lease_id, config.keep_alive_interval) {
            Ok(keep_alive) => {
                tracing::info!(election_path = %config.election_path, %token, "acquired leadership");
                set_phase(&state, Phase::Leading).await;

                listener.take_leadership(cancel.clone()).await;

                keep_alive.stop();
                drop(connector.lease_revoke(lease_id).await);
                set_phase(&state, Phase::Relinquished).await;
                listener.relinquish_leadership().await;
                tracing::info!(election_path = %config.election_path, %token, "relinquished leadership");
            }
            Err(e) => {
                tracing::warn!(election_path = %config.election_path, error = %e, "connector closed before keep-alive could start");
                drop(connector.lease_revoke(lease_id).await);
            }
        }
    }

    let mut guard = state.lock().await;
    guard.phase = Phase::Idle;
    guard.active = false;
    guard.worker_cancel = None;
    drop(guard);
    complete_notify.notify_one();
}

async fn set_phase(state: &Mutex<SelectorState>, phase: Phase) {
    state.lock().await.phase = phase;
}

/// Retries the leadership CAS until it wins or `cancel` fires, waiting on a
/// DELETE watch (bounded by `retry_interval`) between attempts.
async fn acquire_leadership(
    connector: &Connector,
    config: &LeaderSelectorConfig,
    cancel: &CancellationToken,
) -> Result<(String, i64)> {
    loop {
        let token = unique_token(&config.client_id);
        let lease_id = connector.lease_grant(config.lease_ttl_secs).await?;

        if try_acquire(connector, &config.election_path, &token, lease_id).await? {
            return Ok((token, lease_id));
        }

        // Lost the race; this lease is unused, don't let it linger.
        drop(connector.lease_revoke(lease_id).await);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Interrupted),
            _ = wait_for_vacancy(connector, &config.election_path, config.retry_interval) => {}
        }
    }
}

/// CAS: only succeed if the leader key does not exist. On a transaction
/// win, reads the value back and requires it match `token` exactly — this
/// guards the rare case where two candidates both observed "missing" and
/// the loser's write was invisibly superseded.
async fn try_acquire(connector: &Connector, key: &str, token: &str, lease_id: i64) -> Result<bool> {
    let resp = connector
        .cas(
            vec![Compare::version(key, CompareOp::Equal, 0)],
            vec![TxnOp::put(
                key,
                token.as_bytes().to_vec(),
                Some(etcd_client::PutOptions::new().with_lease(lease_id)),
            )],
            vec![TxnOp::get(key, None)],
        )
        .await?;

    if !resp.succeeded() {
        return Ok(false);
    }

    match connector.get_value(key).await? {
        Some(value) => Ok(value == token.as_bytes()),
        None => Ok(false),
    }
}

/// Waits for the leader key to be deleted, or for `timeout` to elapse,
/// whichever comes first.
async fn wait_for_vacancy(connector: &Connector, key: &str, timeout: Duration) {
    let watch = connector.watch(key, false).await;
    let Ok((watcher, mut stream)) = watch else {
        tokio::time::sleep(timeout).await;
        return;
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            message = stream.message() => {
                match message {
                    Ok(Some(resp)) if resp.events().iter().any(|e| e.event_type() == etcd_client::EventType::Delete) => {
                        break;
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        }
    }
    cancel_watcher(watcher).await;
}

/// Convenience adapter turning an async closure into a [`LeadershipListener`].
pub struct FnListener<F> {
    take: F,
}

impl<F, Fut> FnListener<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    pub fn new(take: F) -> Self {
        Self { take }
    }
}

#[async_trait]
impl<F, Fut> LeadershipListener for FnListener<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn take_leadership(&self, cancel: CancellationToken) {
        (self.take)(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_two_second_ttl() {
        let config = LeaderSelectorConfig::default();
        assert_eq!(config.lease_ttl_secs, 2);
    }

}
