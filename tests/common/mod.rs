//! Shared helpers for the etcd-backed integration suite. Every test in
//! `tests/integration.rs` is `#[ignore]`d by default and expects a live
//! etcd endpoint at `ETCD_TEST_ENDPOINTS` (default `127.0.0.1:2379`); run
//! them explicitly with `cargo test -- --ignored`.

use std::future::Future;
use std::time::Duration;

use etcd_recipes::{Connector, ConnectorConfig};

pub fn test_endpoints() -> Vec<String> {
    std::env::var("ETCD_TEST_ENDPOINTS")
        .unwrap_or_else(|_| "127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.to_string())
        .collect()
}

/// A fresh `Connector` plus a unique key prefix, so concurrently-run tests
/// never collide on the same keys.
pub async fn test_connector(test_name: &str) -> (Connector, String) {
    let connector = Connector::connect(ConnectorConfig {
        endpoints: test_endpoints(),
    })
    .await
    .expect("connect to test etcd cluster");
    let prefix = format!("/etcd-recipes-test/{test_name}/{}", uuid::Uuid::new_v4());
    (connector, prefix)
}

/// Polls `condition` every `interval` until it returns `true` or `timeout`
/// elapses. Returns whether the condition was observed true.
pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
