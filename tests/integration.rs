//! Integration scenarios against a live etcd cluster. All tests are
//! `#[ignore]`d by default; run with `cargo test -- --ignored` pointed at a
//! real etcd (see `tests/common/mod.rs` for endpoint configuration).

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use common::{test_connector, wait_for_condition};
use etcd_recipes::{
    AtomicCounter, CounterConfig, CountedBarrier, CountedBarrierConfig, DistributedBarrier,
    BarrierConfig, DoubleBarrier, DoubleBarrierConfig, FifoQueue, LeaderSelector,
    LeaderSelectorConfig, LeadershipListener, PriorityQueue, PriorityQueueConfig, QueueConfig,
};

struct CountingListener {
    connector: etcd_recipes::Connector,
    election_path: String,
    took: Arc<AtomicU32>,
    relinquished: Arc<AtomicU32>,
    tokens: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl LeadershipListener for CountingListener {
    async fn take_leadership(&self, _cancel: CancellationToken) {
        if let Ok(Some(value)) = self.connector.get_value(&self.election_path).await {
            if let Ok(token) = String::from_utf8(value) {
                self.tokens.lock().await.insert(token);
            }
        }
        self.took.fetch_add(1, Ordering::SeqCst);
    }

    async fn relinquish_leadership(&self) {
        self.relinquished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
#[ignore]
async fn ten_contenders_each_lead_exactly_once() {
    let (connector, prefix) = test_connector("leader_election").await;
    let election_path = format!("{prefix}/election");

    let took = Arc::new(AtomicU32::new(0));
    let relinquished = Arc::new(AtomicU32::new(0));
    let tokens = Arc::new(Mutex::new(HashSet::new()));

    let mut selectors = Vec::new();
    for i in 0..10 {
        let listener = Arc::new(CountingListener {
            connector: connector.clone(),
            election_path: election_path.clone(),
            took: Arc::clone(&took),
            relinquished: Arc::clone(&relinquished),
            tokens: Arc::clone(&tokens),
        });
        let config = LeaderSelectorConfig {
            client_id: format!("contender-{i}"),
            election_path: election_path.clone(),
            ..Default::default()
        };
        let selector = LeaderSelector::new(connector.clone(), config, listener).expect("valid config");
        selector.start().await.expect("start");
        selectors.push(selector);
    }

    for selector in &selectors {
        selector
            .wait_on_leadership_complete(Some(Duration::from_secs(20)))
            .await
            .expect("wait");
    }

    assert_eq!(took.load(Ordering::SeqCst), 10);
    assert_eq!(relinquished.load(Ordering::SeqCst), 10);
    assert_eq!(tokens.lock().await.len(), 10);
}

#[tokio::test]
#[ignore]
async fn thirty_counters_net_to_zero() {
    let (connector, prefix) = test_connector("counter").await;
    let counter_path = format!("{prefix}/counter2");

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let connector = connector.clone();
        let counter_path = counter_path.clone();
        tasks.push(tokio::spawn(async move {
            let counter = AtomicCounter::new(
                connector,
                CounterConfig {
                    counter_path,
                    ..Default::default()
                },
            )
            .expect("valid config");
            for _ in 0..25 {
                counter.increment(None).await.expect("increment");
                counter.decrement(None).await.expect("decrement");
                counter.add(5, None).await.expect("add");
                counter.subtract(5, None).await.expect("subtract");
            }
        }));
    }

    for task in tasks {
        task.await.expect("task panicked");
    }

    let counter = AtomicCounter::new(connector, CounterConfig { counter_path, ..Default::default() })
        .expect("valid config");
    assert_eq!(counter.get().await.expect("get"), 0);
}

#[tokio::test]
#[ignore]
async fn priority_queue_dequeues_by_priority_then_age() {
    let (connector, prefix) = test_connector("priority_queue").await;
    let queue_path = format!("{prefix}/queue");
    let queue = PriorityQueue::new(
        connector,
        PriorityQueueConfig { queue_path },
    )
    .expect("valid config");

    queue.enqueue(b"A".to_vec(), 10).await.expect("enqueue A");
    queue.enqueue(b"B".to_vec(), 1).await.expect("enqueue B");
    queue.enqueue(b"C".to_vec(), 5).await.expect("enqueue C");

    let first = queue.dequeue(Some(Duration::from_secs(5))).await.expect("dequeue");
    let second = queue.dequeue(Some(Duration::from_secs(5))).await.expect("dequeue");
    let third = queue.dequeue(Some(Duration::from_secs(5))).await.expect("dequeue");

    assert_eq!(first, Some(b"B".to_vec()));
    assert_eq!(second, Some(b"C".to_vec()));
    assert_eq!(third, Some(b"A".to_vec()));
}

#[tokio::test]
#[ignore]
async fn fifo_queue_preserves_enqueue_order() {
    let (connector, prefix) = test_connector("fifo_queue").await;
    let queue = FifoQueue::new(connector, QueueConfig { queue_path: format!("{prefix}/queue") })
        .expect("valid config");

    for i in 0..5u8 {
        queue.enqueue(vec![i]).await.expect("enqueue");
    }
    for i in 0..5u8 {
        let value = queue.dequeue(Some(Duration::from_secs(5))).await.expect("dequeue");
        assert_eq!(value, Some(vec![i]));
    }
}

#[tokio::test]
#[ignore]
async fn counted_barrier_times_out_when_a_member_never_arrives() {
    let (connector, prefix) = test_connector("counted_barrier").await;
    let barrier_path = format!("{prefix}/barrier");

    let mut tasks = Vec::new();
    for i in 0..4 {
        let connector = connector.clone();
        let barrier_path = barrier_path.clone();
        tasks.push(tokio::spawn(async move {
            let barrier = CountedBarrier::new(
                connector,
                CountedBarrierConfig {
                    client_id: format!("waiter-{i}"),
                    barrier_path,
                    member_count: 5,
                    ..Default::default()
                },
            )
            .expect("valid config");
            barrier.wait_on_barrier(Some(Duration::from_secs(2))).await.expect("wait")
        }));
    }

    for task in tasks {
        assert!(!task.await.expect("task panicked"));
    }

    let waiting_prefix = format!("{barrier_path}/waiting/");
    let cleared = wait_for_condition(Duration::from_secs(5), Duration::from_millis(100), || {
        let connector = connector.clone();
        let waiting_prefix = waiting_prefix.clone();
        async move { connector.count_prefix(&waiting_prefix).await.unwrap_or(-1) == 0 }
    })
    .await;
    assert!(cleared, "waiter keys should expire with their leases");
}

#[tokio::test]
#[ignore]
async fn double_barrier_releases_all_members_together_on_enter_and_leave() {
    let (connector, prefix) = test_connector("double_barrier").await;
    let barrier_path = format!("{prefix}/double");

    let mut tasks = Vec::new();
    for i in 0..5 {
        let connector = connector.clone();
        let barrier_path = barrier_path.clone();
        tasks.push(tokio::spawn(async move {
            let barrier = DoubleBarrier::new(
                connector,
                DoubleBarrierConfig {
                    client_id: format!("member-{i}"),
                    barrier_path,
                    member_count: 5,
                    ..Default::default()
                },
            )
            .expect("valid config");
            let entered = barrier.enter(Some(Duration::from_secs(10))).await.expect("enter");
            let left = barrier.leave(Some(Duration::from_secs(10))).await.expect("leave");
            entered && left
        }));
    }

    for task in tasks {
        assert!(task.await.expect("task panicked"));
    }
}

#[tokio::test]
#[ignore]
async fn barrier_release_is_observed_after_holder_lease_expires() {
    let (connector, prefix) = test_connector("barrier_ttl").await;
    let barrier_path = format!("{prefix}/barrier");

    let holder = DistributedBarrier::new(
        connector.clone(),
        BarrierConfig {
            client_id: "holder".to_string(),
            barrier_path: barrier_path.clone(),
            lease_ttl_secs: 2,
            ..Default::default()
        },
    )
    .expect("valid config");
    assert!(holder.set_barrier().await.expect("set"));

    // Simulate the holder dying: drop it without calling remove_barrier, so
    // the keep-alive task stops and the lease expires on its own.
    drop(holder);

    let waiter = DistributedBarrier::new(
        connector,
        BarrierConfig {
            client_id: "waiter".to_string(),
            barrier_path,
            ..Default::default()
        },
    )
    .expect("valid config");

    let released = waiter
        .wait_on_barrier(Some(Duration::from_secs(6)))
        .await
        .expect("wait");
    assert!(released);
}
