//! Cluster event fan-out tests: every member's listeners observe each
//! published event exactly once, transport duplicates included.

mod test_harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notegrid::cluster::event::{auth_event_payload, note_event_payload};
use notegrid::cluster::transport::PeerClient;
use notegrid::cluster::{ClusterEvent, ClusterEventListener, AUTH_EVENT_TOPIC, NOTE_EVENT_TOPIC};
use test_harness::{assert_eventually, TestCluster};

struct Counter(AtomicUsize);

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicUsize::new(0)))
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl ClusterEventListener for Counter {
    fn on_event(&self, _event: &ClusterEvent) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn publish_reaches_every_member_once() {
    let mut cluster = TestCluster::new(3, 9700).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let mut counters = Vec::new();
    let mut subs = Vec::new();
    for node in cluster.nodes.values() {
        let counter = Counter::new();
        subs.push(node.cluster.subscribe(NOTE_EVENT_TOPIC, counter.clone()));
        counters.push(counter);
    }

    let origin = cluster.get_node(1).unwrap();
    origin
        .cluster
        .publish(NOTE_EVENT_TOPIC, note_event_payload("n1", "run_started", 1));

    assert_eventually(
        || async { counters.iter().all(|c| c.count() == 1) },
        Duration::from_secs(3),
        "every member's listener should see the event once",
    )
    .await;

    // Settle and re-check: still exactly once each
    tokio::time::sleep(Duration::from_millis(300)).await;
    for counter in &counters {
        assert_eq!(counter.count(), 1);
    }

    drop(subs);
    cluster.shutdown().await;
}

#[tokio::test]
async fn transport_duplicates_are_observed_once() {
    let mut cluster = TestCluster::new(2, 9710).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let target = cluster.get_node(2).unwrap();
    let counter = Counter::new();
    let _sub = target.cluster.subscribe(AUTH_EVENT_TOPIC, counter.clone());

    // Deliver the very same event twice, as a retrying publisher would
    let client = PeerClient::new(2, &format!("127.0.0.1:{}", target.port));
    let event = ClusterEvent {
        topic: AUTH_EVENT_TOPIC.to_string(),
        payload: auth_event_payload("n1", "writer", &["alice".to_string()]),
        origin_node: 1,
        seq: 42,
    };
    client.send_event(&event).await.expect("first delivery");
    client.send_event(&event).await.expect("second delivery");

    assert_eventually(
        || async { counter.count() == 1 },
        Duration::from_secs(2),
        "listener should observe the duplicated event once",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.count(), 1, "duplicate must stay collapsed");

    cluster.shutdown().await;
}

#[tokio::test]
async fn events_keep_per_origin_order_across_the_wire() {
    let mut cluster = TestCluster::new(2, 9720).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let target = cluster.get_node(2).unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        Arc::new(move |event: &ClusterEvent| {
            seen.lock()
                .unwrap()
                .push(event.payload["action"].as_str().unwrap_or("").to_string());
        })
    };
    let _sub = target.cluster.subscribe(NOTE_EVENT_TOPIC, recorder);

    let origin = cluster.get_node(1).unwrap();
    for action in ["edit", "run_started", "run_finished"] {
        origin
            .cluster
            .publish(NOTE_EVENT_TOPIC, note_event_payload("n1", action, 1));
    }

    assert_eventually(
        || async { seen.lock().unwrap().len() == 3 },
        Duration::from_secs(3),
        "all three events should arrive",
    )
    .await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["edit", "run_started", "run_finished"],
        "per-origin order must be preserved"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn cancelled_subscription_stops_observing() {
    let mut cluster = TestCluster::new(2, 9730).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let node = cluster.get_node(1).unwrap();
    let counter = Counter::new();
    let sub = node.cluster.subscribe(NOTE_EVENT_TOPIC, counter.clone());

    node.cluster
        .publish(NOTE_EVENT_TOPIC, note_event_payload("n1", "one", 1));
    assert_eventually(
        || async { counter.count() == 1 },
        Duration::from_secs(2),
        "first event should arrive",
    )
    .await;

    sub.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    node.cluster
        .publish(NOTE_EVENT_TOPIC, note_event_payload("n1", "two", 1));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.count(), 1, "no delivery after unsubscribe");

    cluster.shutdown().await;
}
