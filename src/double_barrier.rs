//! Two-phase rendezvous: every member enters together, does its work, then
//! every member leaves together. Composed from two [`CountedBarrier`]s.

use std::time::Duration;

use crate::connector::Connector;
use crate::counted_barrier::{CountedBarrier, CountedBarrierConfig};
use crate::error::Result;
use crate::util::{require_non_empty, require_positive};

#[derive(Debug, Clone)]
pub struct DoubleBarrierConfig {
    pub client_id: String,
    pub barrier_path: String,
    pub member_count: u32,
    pub lease_ttl_secs: i64,
    pub keep_alive_interval: Duration,
}

impl Default for DoubleBarrierConfig {
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

pub struct DoubleBarrier {
    enter: CountedBarrier,
    leave: CountedBarrier,
}

impl DoubleBarrier {
    pub fn new(connector: Connector, config: DoubleBarrierConfig) -> Result<Self> {
        require_non_empty("barrier_path", &config.barrier_path)?;
        require_positive("member_count", config.member_count)?;

        let sub_config = |suffix: &str| CountedBarrierConfig {
            client_id: config.client_id.clone(),
            barrier_path: format!("{}/{suffix}", config.barrier_path),
            member_count: config.member_count,
            lease_ttl_secs: config.lease_ttl_secs,
            keep_alive_interval: config.keep_alive_interval,
        };

        Ok(Self {
            enter: CountedBarrier::new(connector.clone(), sub_config("enter"))?,
            leave: CountedBarrier::new(connector, sub_config("leave"))?,
        })
    }

    /// Blocks until every member has called `enter`.
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<bool> {
        self.enter.wait_on_barrier(timeout).await
    }

    /// Blocks until every member has called `leave`. Members should call
    /// this only after their work for the current round is complete.
    pub async fn leave(&self, timeout: Option<Duration>) -> Result<bool> {
        self.leave.wait_on_barrier(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_barrier_path() {
        let config = DoubleBarrierConfig::default();
        assert!(require_non_empty("barrier_path", &config.barrier_path).is_err());
    }

    #[test]
    fn rejects_zero_member_count() {
        let config = DoubleBarrierConfig {
            barrier_path: "/double".to_string(),
            member_count: 0,
            ..Default::default()
        };
        assert!(require_positive("member_count", config.member_count).is_err());
    }
}
