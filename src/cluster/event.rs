use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Note lifecycle changes (run started/finished, content edits)
pub const NOTE_EVENT_TOPIC: &str = "note";
/// Permission changes on a note
pub const AUTH_EVENT_TOPIC: &str = "auth";
/// Backend setting changes
pub const SETTING_EVENT_TOPIC: &str = "setting";

/// A domain event fanned out to every member's local listeners.
/// Immutable once published; duplicates on the wire are collapsed by
/// `(origin_node, seq)` before listeners see them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    pub origin_node: u64,
    pub seq: u64,
}

pub fn note_event_payload(note_id: &str, action: &str, actor_node: u64) -> serde_json::Value {
    serde_json::json!({
        "note_id": note_id,
        "action": action,
        "actor_node": actor_node,
    })
}

pub fn auth_event_payload(
    note_id: &str,
    permission_kind: &str,
    entities: &[String],
) -> serde_json::Value {
    serde_json::json!({
        "note_id": note_id,
        "permission_kind": permission_kind,
        "entities": entities,
    })
}

pub fn setting_event_payload(setting_id: &str, action: &str) -> serde_json::Value {
    serde_json::json!({
        "setting_id": setting_id,
        "action": action,
    })
}

/// A local callback for one topic. Invoked on the node's event-dispatch
/// task, never on the publishing caller, so a slow listener cannot stall
/// cluster I/O.
pub trait ClusterEventListener: Send + Sync {
    fn on_event(&self, event: &ClusterEvent);
}

impl<F> ClusterEventListener for F
where
    F: Fn(&ClusterEvent) + Send + Sync,
{
    fn on_event(&self, event: &ClusterEvent) {
        self(event)
    }
}

enum ControlMessage {
    Subscribe {
        id: u64,
        topic: String,
        listener: Arc<dyn ClusterEventListener>,
    },
    Unsubscribe {
        id: u64,
        topic: String,
    },
}

/// Cancellation token for a registered listener. Dropping it (or calling
/// `cancel`) unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cancel(self) {
        // Drop impl does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlMessage::Unsubscribe {
            id: self.id,
            topic: self.topic.clone(),
        });
    }
}

/// Per-node event fan-out: one ingest queue, one dispatch task, a
/// topic-keyed listener table.
pub struct EventBus {
    node_id: u64,
    seq: AtomicU64,
    next_sub_id: AtomicU64,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl EventBus {
    pub fn new(node_id: u64) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch_loop(event_rx, control_rx));

        Self {
            node_id,
            // Seeded from the wall clock so a restarted node's sequence
            // numbers stay above peers' dedup watermarks.
            seq: AtomicU64::new(Utc::now().timestamp_millis() as u64),
            next_sub_id: AtomicU64::new(1),
            event_tx,
            control_tx,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Stamp a new locally originated event.
    pub fn make_event(&self, topic: &str, payload: serde_json::Value) -> ClusterEvent {
        ClusterEvent {
            topic: topic.to_string(),
            payload,
            origin_node: self.node_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Hand an event (local or received from a peer) to the dispatch task.
    pub fn ingest(&self, event: ClusterEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::warn!("event dispatch task gone, dropping event");
        }
    }

    pub fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn ClusterEventListener>,
    ) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.control_tx.send(ControlMessage::Subscribe {
            id,
            topic: topic.to_string(),
            listener,
        });
        Subscription {
            id,
            topic: topic.to_string(),
            control_tx: self.control_tx.clone(),
        }
    }
}

async fn dispatch_loop(
    mut event_rx: mpsc::UnboundedReceiver<ClusterEvent>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    let mut listeners: HashMap<String, Vec<(u64, Arc<dyn ClusterEventListener>)>> = HashMap::new();
    // Highest sequence number seen per (origin, topic). Per-origin publishes
    // are sequential, so anything at or below the watermark is a transport
    // redelivery.
    let mut watermarks: HashMap<(u64, String), u64> = HashMap::new();

    loop {
        tokio::select! {
            msg = control_rx.recv() => {
                match msg {
                    Some(ControlMessage::Subscribe { id, topic, listener }) => {
                        listeners.entry(topic).or_default().push((id, listener));
                    }
                    Some(ControlMessage::Unsubscribe { id, topic }) => {
                        if let Some(subs) = listeners.get_mut(&topic) {
                            subs.retain(|(sub_id, _)| *sub_id != id);
                        }
                    }
                    None => break,
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };

                let mark = watermarks
                    .entry((event.origin_node, event.topic.clone()))
                    .or_insert(0);
                if event.seq <= *mark {
                    tracing::trace!(
                        topic = %event.topic,
                        origin = event.origin_node,
                        seq = event.seq,
                        "Duplicate event dropped"
                    );
                    continue;
                }
                *mark = event.seq;

                if let Some(subs) = listeners.get(&event.topic) {
                    for (_, listener) in subs {
                        listener.on_event(&event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<ClusterEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl ClusterEventListener for Recorder {
        fn on_event(&self, event: &ClusterEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn delivers_to_topic_listeners() {
        let bus = EventBus::new(1);
        let recorder = Recorder::new();
        let _sub = bus.subscribe(NOTE_EVENT_TOPIC, recorder.clone());

        let event = bus.make_event(NOTE_EVENT_TOPIC, note_event_payload("n1", "run", 1));
        bus.ingest(event);
        settle().await;

        assert_eq!(recorder.count(), 1);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].payload["note_id"], "n1");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_collapsed() {
        let bus = EventBus::new(1);
        let recorder = Recorder::new();
        let _sub = bus.subscribe(AUTH_EVENT_TOPIC, recorder.clone());

        let event = bus.make_event(
            AUTH_EVENT_TOPIC,
            auth_event_payload("n1", "reader", &["alice".to_string()]),
        );
        // Retried publication delivers the same event twice
        bus.ingest(event.clone());
        bus.ingest(event);
        settle().await;

        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new(1);
        let notes = Recorder::new();
        let settings = Recorder::new();
        let _a = bus.subscribe(NOTE_EVENT_TOPIC, notes.clone());
        let _b = bus.subscribe(SETTING_EVENT_TOPIC, settings.clone());

        bus.ingest(bus.make_event(NOTE_EVENT_TOPIC, note_event_payload("n1", "run", 1)));
        settle().await;

        assert_eq!(notes.count(), 1);
        assert_eq!(settings.count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(1);
        let recorder = Recorder::new();
        let sub = bus.subscribe(NOTE_EVENT_TOPIC, recorder.clone());

        bus.ingest(bus.make_event(NOTE_EVENT_TOPIC, note_event_payload("n1", "run", 1)));
        settle().await;
        assert_eq!(recorder.count(), 1);

        sub.cancel();
        settle().await;

        bus.ingest(bus.make_event(NOTE_EVENT_TOPIC, note_event_payload("n1", "run", 1)));
        settle().await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn per_origin_order_preserved() {
        let bus = EventBus::new(1);
        let recorder = Recorder::new();
        let _sub = bus.subscribe(NOTE_EVENT_TOPIC, recorder.clone());

        for action in ["a", "b", "c"] {
            bus.ingest(bus.make_event(NOTE_EVENT_TOPIC, note_event_payload("n1", action, 1)));
        }
        settle().await;

        let seen = recorder.seen.lock().unwrap();
        let actions: Vec<_> = seen.iter().map(|e| e.payload["action"].clone()).collect();
        assert_eq!(actions, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn events_from_distinct_origins_both_delivered() {
        let bus = EventBus::new(1);
        let recorder = Recorder::new();
        let _sub = bus.subscribe(NOTE_EVENT_TOPIC, recorder.clone());

        // Same seq from two different origins must not collide
        bus.ingest(ClusterEvent {
            topic: NOTE_EVENT_TOPIC.to_string(),
            payload: note_event_payload("n1", "run", 2),
            origin_node: 2,
            seq: 7,
        });
        bus.ingest(ClusterEvent {
            topic: NOTE_EVENT_TOPIC.to_string(),
            payload: note_event_payload("n2", "run", 3),
            origin_node: 3,
            seq: 7,
        });
        settle().await;

        assert_eq!(recorder.count(), 2);
    }
}
