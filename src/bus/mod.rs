//! Broadcast event bus: fan-out publish/subscribe on typed topics.
//!
//! The bus carries short control and notification messages between the
//! pipeline services. There is no durable log: late subscribers miss prior
//! messages. Each subscriber owns a bounded queue with drop-oldest on
//! overflow; drops are counted into the shared metrics registry under
//! `bus.events_dropped`.
//!
//! Delivery is at-least-once and ordered per publisher (a publish appends to
//! every matching queue before returning); consumers key idempotence on
//! `(topic, id)`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concept::ConceptId;
use crate::episode::EpisodeId;
use crate::linalg::Complex32;
use crate::metrics::{Counter, Metrics};

/// Default bound on a subscriber's delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Named topics carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A new episode was committed to the vault.
    EpisodeCreated,
    /// A consolidation cycle committed a weight update.
    ConceptDelta,
    /// Sign-quantized trajectory traversed during a cycle.
    ActivationTrace,
    /// A prune operation committed.
    GraphPruned,
    /// A spectral mode's coupling coefficients changed materially.
    CouplingUpdate,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::EpisodeCreated => "episode.created",
            Topic::ConceptDelta => "concept.delta",
            Topic::ActivationTrace => "activation.trace",
            Topic::GraphPruned => "graph.pruned",
            Topic::CouplingUpdate => "coupling.update",
        };
        write!(f, "{s}")
    }
}

/// A message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// `episode.created{id, created_at, size}`
    EpisodeCreated {
        id: EpisodeId,
        created_at: u64,
        size: u64,
    },
    /// `concept.delta{job_id, changed_concepts[], energy_delta, w_version}`
    ConceptDelta {
        job_id: String,
        changed_concepts: Vec<ConceptId>,
        energy_delta: f64,
        w_version: u64,
    },
    /// `activation.trace{episode_id, trajectory[]}`
    ///
    /// Each trajectory step is a sign-quantized state over `concept_ids`.
    ActivationTrace {
        episode_id: EpisodeId,
        concept_ids: Vec<ConceptId>,
        trajectory: Vec<Vec<f32>>,
    },
    /// `graph.pruned{prune_id, edges_removed, quality_delta}`
    GraphPruned {
        prune_id: String,
        edges_removed: usize,
        quality_delta: f64,
    },
    /// `coupling.update{mode_id, coefficients_diff, eigenvalue, stability}`
    CouplingUpdate {
        mode_id: String,
        coefficients_diff: Vec<(ConceptId, f32)>,
        eigenvalue: Complex32,
        stability: f32,
    },
}

impl Event {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::EpisodeCreated { .. } => Topic::EpisodeCreated,
            Event::ConceptDelta { .. } => Topic::ConceptDelta,
            Event::ActivationTrace { .. } => Topic::ActivationTrace,
            Event::GraphPruned { .. } => Topic::GraphPruned,
            Event::CouplingUpdate { .. } => Topic::CouplingUpdate,
        }
    }

    /// The idempotence key within the topic (episode id, job id, ...).
    pub fn id(&self) -> String {
        match self {
            Event::EpisodeCreated { id, .. } => id.to_string(),
            Event::ConceptDelta { job_id, .. } => job_id.clone(),
            Event::ActivationTrace { episode_id, .. } => episode_id.to_string(),
            Event::GraphPruned { prune_id, .. } => prune_id.clone(),
            Event::CouplingUpdate { mode_id, .. } => mode_id.clone(),
        }
    }
}

struct QueueState {
    queue: VecDeque<Event>,
    closed: bool,
}

struct SubscriberShared {
    name: String,
    topics: Vec<Topic>,
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
    dropped: Counter,
}

impl SubscriberShared {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }

    /// Append an event, dropping the oldest entry on overflow.
    /// Returns false once the subscription is closed.
    fn push(&self, event: Event) -> bool {
        let mut state = self.state.lock().expect("bus queue poisoned");
        if state.closed {
            return false;
        }
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            self.dropped.inc();
        }
        state.queue.push_back(event);
        self.available.notify_one();
        true
    }
}

/// Handle to a subscription. Dropping it closes the queue.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Subscriber name (used in metrics and logs).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Pop the next event without blocking.
    pub fn try_recv(&self) -> Option<Event> {
        let mut state = self.shared.state.lock().expect("bus queue poisoned");
        state.queue.pop_front()
    }

    /// Block for the next event up to `timeout`. Returns `None` on timeout
    /// or once the subscription is closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut state = self.shared.state.lock().expect("bus queue poisoned");
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            let (next, result) = self
                .shared
                .available
                .wait_timeout(state, timeout)
                .expect("bus queue poisoned");
            state = next;
            if result.timed_out() {
                return state.queue.pop_front();
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        let mut state = self.shared.state.lock().expect("bus queue poisoned");
        state.queue.drain(..).collect()
    }

    /// Number of queued events.
    pub fn depth(&self) -> usize {
        self.shared.state.lock().expect("bus queue poisoned").queue.len()
    }

    /// Events dropped from this queue since subscription.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.get()
    }

    /// Close the subscription: publishers stop delivering, queued events
    /// remain readable until drained.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().expect("bus queue poisoned");
        state.closed = true;
        self.shared.available.notify_all();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// The fan-out bus shared by all services.
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    metrics: Arc<Metrics>,
    published: Counter,
}

impl EventBus {
    /// Create a bus wired to the shared metrics registry.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let published = metrics.counter("bus.events_published");
        Self {
            subscribers: Mutex::new(Vec::new()),
            metrics,
            published,
        }
    }

    /// Register a subscriber for the given topics (empty = all topics) with
    /// the given queue capacity.
    pub fn subscribe_with_capacity(
        &self,
        name: impl Into<String>,
        topics: &[Topic],
        capacity: usize,
    ) -> Subscription {
        let name = name.into();
        let dropped = self.metrics.counter("bus.events_dropped");
        let shared = Arc::new(SubscriberShared {
            name,
            topics: topics.to_vec(),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            dropped,
        });
        self.subscribers
            .lock()
            .expect("bus registry poisoned")
            .push(Arc::clone(&shared));
        Subscription { shared }
    }

    /// Register a subscriber with the default queue capacity.
    pub fn subscribe(&self, name: impl Into<String>, topics: &[Topic]) -> Subscription {
        self.subscribe_with_capacity(name, topics, DEFAULT_QUEUE_CAPACITY)
    }

    /// Publish an event to every live subscriber of its topic.
    ///
    /// Returns the number of queues the event was delivered to. Closed
    /// subscriptions are pruned as a side effect.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        self.published.inc();

        let mut subs = self.subscribers.lock().expect("bus registry poisoned");
        let mut delivered = 0;
        subs.retain(|sub| {
            if !sub.wants(topic) {
                return true;
            }
            if sub.push(event.clone()) {
                delivered += 1;
                true
            } else {
                false
            }
        });
        tracing::trace!(topic = %topic, id = %event.id(), delivered, "published");
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(Metrics::new()))
    }

    fn created(n: u8) -> Event {
        Event::EpisodeCreated {
            id: EpisodeId([n; 16]),
            created_at: n as u64,
            size: 100,
        }
    }

    #[test]
    fn fan_out_reaches_all_topic_subscribers() {
        let bus = bus();
        let a = bus.subscribe("a", &[Topic::EpisodeCreated]);
        let b = bus.subscribe("b", &[]);
        let c = bus.subscribe("c", &[Topic::GraphPruned]);

        assert_eq!(bus.publish(created(1)), 2);
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_none());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let bus = EventBus::new(Arc::clone(&metrics));
        let sub = bus.subscribe_with_capacity("s", &[Topic::EpisodeCreated], 4);

        for n in 0..10u8 {
            bus.publish(created(n));
        }
        assert_eq!(sub.depth(), 4);
        assert_eq!(sub.dropped(), 6);
        assert_eq!(metrics.value("bus.events_dropped"), 6);

        // The oldest survivors are 6..9, still in publish order.
        let survivors: Vec<u64> = sub
            .drain()
            .into_iter()
            .map(|e| match e {
                Event::EpisodeCreated { created_at, .. } => created_at,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(survivors, vec![6, 7, 8, 9]);
    }

    #[test]
    fn closed_subscription_is_pruned() {
        let bus = bus();
        let sub = bus.subscribe("s", &[]);
        sub.close();
        assert_eq!(bus.publish(created(1)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn recv_timeout_returns_queued_event() {
        let bus = bus();
        let sub = bus.subscribe("s", &[]);
        bus.publish(created(1));
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_some());
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn late_subscriber_misses_prior_messages() {
        let bus = bus();
        bus.publish(created(1));
        let sub = bus.subscribe("late", &[]);
        assert!(sub.try_recv().is_none());
    }
}
