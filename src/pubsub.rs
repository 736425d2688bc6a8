//! The publisher/subscriber fan-out primitive (§4.4).
//!
//! A single producer generator inside one actor is multiplexed to many
//! remote subscribers, topic-filtered, with at most one producer task alive
//! per `(actor, task_name)` slot at any instant. Per-actor state is anchored
//! in the actor's [`crate::actor::ActorState`] state space under the
//! [`PublisherRegistry`] type key, matching §9's "Global state" note.

use std::{collections::HashMap, sync::Arc};

use dashmap::{DashMap, DashSet};
use futures::{stream::BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::PubSubError;

/// The invocation context a subscriber is reached through: an unbounded
/// sender the fan-out pushes payloads into. The RPC dispatch side bridges
/// the matching receiver into an `RpcOutcome::Stream`, so the generic
/// `rpc-yield`/`rpc-stop` machinery already built for streaming calls is
/// what actually puts bytes on the wire — this module only ever produces
/// values, never touches a channel directly.
#[derive(Clone)]
pub struct SubscriberCtx {
    tx: mpsc::UnboundedSender<Value>,
}

impl SubscriberCtx {
    fn send(&self, payload: Value) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Creates a fresh subscriber context together with the stream its dispatch
/// handler should return as `RpcOutcome::Stream` (§4.6 "Generators as
/// results"): every payload `publish` sends into the context arrives here.
pub fn subscriber_channel() -> (SubscriberCtx, BoxStream<'static, Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
    (SubscriberCtx { tx }, Box::pin(stream))
}

/// Callback handed to the producer generator: the current union of
/// subscribed topics for its slot, recomputed fresh on every call (§4.4
/// step 3 — "dynamic; reflects joins and leaves").
pub type GetTopics = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// One produced item: a mapping of topic to value, as the generator yields.
pub type ProducedItem = Result<HashMap<String, Value>, PubSubError>;

/// The producer generator: given a `get_topics` callback, returns the stream
/// of items to fan out.
pub type Producer = Arc<dyn Fn(GetTopics) -> BoxStream<'static, ProducedItem> + Send + Sync>;

/// Transforms `(topic, value)` into the payload delivered to subscribers.
/// Defaults to `{topic: value}`.
pub type Packetizer = Arc<dyn Fn(&str, &Value) -> HashMap<String, Value> + Send + Sync>;

fn default_packetizer(topic: &str, value: &Value) -> HashMap<String, Value> {
    HashMap::from([(topic.to_owned(), value.clone())])
}

#[derive(Default)]
struct Slot {
    // Tokio's async Mutex grants the lock in FIFO acquisition order, which is
    // exactly the "strict FIFO" producer handoff §5 requires.
    lock: Mutex<()>,
    subscribers: DashMap<Uuid, SubscriberCtx>,
    topic_subs: DashMap<String, DashSet<Uuid>>,
    sub_topics: DashMap<Uuid, DashSet<String>>,
}

impl Slot {
    fn get_topics(&self) -> Vec<String> {
        self.topic_subs
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    fn join(&self, sub_id: Uuid, ctx: SubscriberCtx, topics: &[String]) {
        self.subscribers.insert(sub_id, ctx);
        let owned = self.sub_topics.entry(sub_id).or_default();
        for topic in topics {
            self.topic_subs.entry(topic.clone()).or_default().insert(sub_id);
            owned.insert(topic.clone());
        }
    }

    /// Removes a subscriber from every topic set in this slot (§4.4 step 5
    /// and step 8).
    fn leave(&self, sub_id: Uuid) {
        self.subscribers.remove(&sub_id);
        if let Some((_, topics)) = self.sub_topics.remove(&sub_id) {
            for topic in topics.iter() {
                if let Some(subs) = self.topic_subs.get(topic.as_str()) {
                    subs.remove(&sub_id);
                }
            }
        }
    }
}

/// Per-actor registry of publisher slots, one per declared `task_name` plus
/// the unnamed default slot (§3 "Nursery"/§4.4 "Per-actor process-wide
/// state").
#[derive(Clone)]
pub struct PublisherRegistry {
    declared: Arc<DashSet<String>>,
    slots: Arc<DashMap<String, Arc<Slot>>>,
}

impl PublisherRegistry {
    /// Declares the task-name set a publisher decoration exposes. An empty
    /// set means only the unnamed slot (task_name omitted) is valid.
    pub fn new(declared_task_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            declared: Arc::new(declared_task_names.into_iter().collect()),
            slots: Arc::new(DashMap::new()),
        }
    }

    fn slot_for(&self, task_name: &Option<String>) -> Result<Arc<Slot>, PubSubError> {
        let key = task_name.clone().unwrap_or_default();
        if key.is_empty() {
            if !self.declared.is_empty() {
                return Err(PubSubError::UnknownSlot(
                    "task_name is required: this publisher declares named slots".into(),
                ));
            }
        } else if !self.declared.contains(&key) {
            return Err(PubSubError::UnknownSlot(key));
        }
        Ok(self.slots.entry(key).or_insert_with(|| Arc::new(Slot::default())).clone())
    }

    /// Implements the call contract of §4.4: merges `topics` into the slot,
    /// takes the producer-mutex turn (possibly queueing behind another
    /// subscriber), and fans out the generator's yields until this
    /// subscriber's slot has no topics left subscribed by anyone.
    pub async fn publish(
        &self,
        task_name: Option<String>,
        topics: Vec<String>,
        packetizer: Option<Packetizer>,
        ctx: SubscriberCtx,
        producer: Producer,
    ) -> Result<(), PubSubError> {
        let slot = self.slot_for(&task_name)?;
        let sub_id = Uuid::new_v4();
        slot.join(sub_id, ctx, &topics);

        let guard = slot.lock.lock().await;
        let result = run_producer(&slot, &producer, packetizer).await;
        drop(guard);
        slot.leave(sub_id);
        result
    }
}

async fn run_producer(slot: &Slot, producer: &Producer, packetizer: Option<Packetizer>) -> Result<(), PubSubError> {
    let packetizer = packetizer.unwrap_or_else(|| Arc::new(default_packetizer));
    let mut retried = false;

    loop {
        let get_topics: GetTopics = {
            let topic_subs = slot.topic_subs.clone();
            Arc::new(move || {
                topic_subs
                    .iter()
                    .filter(|e| !e.value().is_empty())
                    .map(|e| e.key().clone())
                    .collect()
            })
        };
        if get_topics().is_empty() {
            return Ok(());
        }

        let mut stream = producer(get_topics.clone());
        loop {
            match stream.next().await {
                Some(Ok(item)) => {
                    fan_out(slot, &item, &packetizer);
                    if get_topics().is_empty() {
                        return Ok(());
                    }
                }
                Some(Err(e)) if !retried => {
                    tracing::warn!(error = %e, "publisher generator failed, respawning once");
                    retried = true;
                    break;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

fn fan_out(slot: &Slot, item: &HashMap<String, Value>, packetizer: &Packetizer) {
    let mut payloads: HashMap<Uuid, HashMap<String, Value>> = HashMap::new();
    for (topic, value) in item {
        let Some(subs) = slot.topic_subs.get(topic.as_str()) else { continue };
        let packet = packetizer(topic, value);
        for sub_id in subs.iter() {
            payloads.entry(*sub_id).or_default().extend(packet.clone());
        }
    }

    let mut dead = Vec::new();
    for (sub_id, payload) in payloads {
        if let Some(ctx) = slot.subscribers.get(&sub_id) {
            let value = serde_json::to_value(payload).unwrap_or(Value::Null);
            if !ctx.send(value) {
                dead.push(sub_id);
            }
        }
    }
    for sub_id in dead {
        // A broken subscriber channel is dropped silently; other subscribers
        // are unaffected (§4.4 "Failure isolation").
        slot.leave(sub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_slot_rejected_when_names_are_declared() {
        let registry = PublisherRegistry::new(["ticks".to_string()]);
        let err = registry.slot_for(&None).unwrap_err();
        assert!(matches!(err, PubSubError::UnknownSlot(_)));
    }

    #[test]
    fn undeclared_task_name_is_rejected() {
        let registry = PublisherRegistry::new(["ticks".to_string()]);
        let err = registry.slot_for(&Some("bogus".to_string())).unwrap_err();
        assert!(matches!(err, PubSubError::UnknownSlot(name) if name == "bogus"));
    }

    #[tokio::test]
    async fn fan_out_only_reaches_subscribed_topics() {
        let registry = PublisherRegistry::new(["feed".to_string()]);
        let (ctx_t1, mut stream_t1) = subscriber_channel();
        let (ctx_both, mut stream_both) = subscriber_channel();

        let slot = registry.slot_for(&Some("feed".to_string())).unwrap();
        slot.join(Uuid::new_v4(), ctx_t1, &["t1".to_string()]);
        slot.join(Uuid::new_v4(), ctx_both, &["t1".to_string(), "t2".to_string()]);

        let item = HashMap::from([("t1".to_string(), Value::from(1)), ("t2".to_string(), Value::from(2))]);
        fan_out(&slot, &item, &Arc::new(default_packetizer));

        let got_t1 = stream_t1.next().await.unwrap();
        assert_eq!(got_t1, serde_json::json!({ "t1": 1 }));
        let got_both = stream_both.next().await.unwrap();
        assert_eq!(got_both, serde_json::json!({ "t1": 1, "t2": 2 }));
    }

    #[tokio::test]
    async fn dead_subscriber_is_dropped_without_affecting_others() {
        let registry = PublisherRegistry::new(Vec::<String>::new());
        let (ctx_live, mut stream_live) = subscriber_channel();
        let (ctx_dead, stream_dead) = subscriber_channel();
        drop(stream_dead);

        let slot = registry.slot_for(&None).unwrap();
        let live_id = Uuid::new_v4();
        let dead_id = Uuid::new_v4();
        slot.join(live_id, ctx_live, &["t1".to_string()]);
        slot.join(dead_id, ctx_dead, &["t1".to_string()]);

        let item = HashMap::from([("t1".to_string(), Value::from("hi"))]);
        fan_out(&slot, &item, &Arc::new(default_packetizer));

        assert_eq!(stream_live.next().await.unwrap(), serde_json::json!({ "t1": "hi" }));
        assert!(!slot.subscribers.contains_key(&dead_id));
        assert!(slot.subscribers.contains_key(&live_id));
    }
}
