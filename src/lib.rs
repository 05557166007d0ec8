//! Distributed coordination recipes layered on etcd v3: leader election,
//! barriers, FIFO/priority queues, an atomic counter, and service discovery.
//!
//! Every recipe is built from a shared [`connector::Connector`], which owns
//! the underlying `etcd_client::Client` and the close-once plumbing around
//! it. Construct one `Connector`, then hand clones of it to as many recipe
//! instances as the application needs.

pub mod barrier;
pub mod connector;
pub mod counted_barrier;
pub mod counter;
pub mod double_barrier;
pub mod error;
pub mod leader_selector;
pub mod queue;
pub mod service_discovery;
mod util;

pub use barrier::{BarrierConfig, DistributedBarrier};
pub use connector::{Connector, ConnectorConfig, KeepAliveHandle};
pub use counted_barrier::{CountedBarrier, CountedBarrierConfig};
pub use counter::{AtomicCounter, CounterConfig};
pub use double_barrier::{DoubleBarrier, DoubleBarrierConfig};
pub use error::{Error, Result};
pub use leader_selector::{
    FnListener, LeaderSelector, LeaderSelectorConfig, LeadershipListener, Phase,
};
pub use queue::{FifoQueue, PriorityQueue, PriorityQueueConfig, QueueConfig};
pub use service_discovery::{
    CacheEvent, ServiceCache, ServiceCacheListener, ServiceDiscovery, ServiceDiscoveryConfig,
    ServiceInstance, ServiceType,
};
