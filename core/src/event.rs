// Event bus implementation
use crate::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delivery guarantee requested by a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoSLevel {
    /// Drop on full queue or under backpressure; never blocks the publisher
    QosRealtime,
    /// Bounded queue; publisher awaits capacity
    QosBatched,
    /// Large bounded queue; publisher awaits capacity
    QosBackground,
}

/// An event travelling over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub timestamp_ms: i64,
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub confidence: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: i32,
}

impl Event {
    /// Build an event stamped with a fresh id and the current wall clock
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: next_event_id(),
            r#type: event_type.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
            metadata: HashMap::new(),
            payload: Vec::new(),
            confidence: 1.0,
            tags: Vec::new(),
            priority: 50,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Text carried by the event: `metadata["text"]`, else the UTF-8 payload
    pub fn text(&self) -> String {
        self.metadata
            .get("text")
            .cloned()
            .unwrap_or_else(|| String::from_utf8_lossy(&self.payload).to_string())
    }
}

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    event_types: Vec<String>,
    qos: QoSLevel,
    sender: mpsc::Sender<Event>,
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub backlog_size: usize,
    pub dropped_events: u64,
}

/// Event bus core implementation
pub struct EventBus {
    // Topic -> Subscriber list
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,

    // Statistics
    stats: Arc<DashMap<String, EventBusStats>>,

    // Backpressure threshold
    backpressure_threshold: usize,
}

impl EventBus {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
            backpressure_threshold: 10_000,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!("Event Bus started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Event Bus shutting down");
        self.subscriptions.clear();
        Ok(())
    }

    /// Publish event to topic, returning the number of subscribers reached
    pub async fn publish(&self, topic: &str, event: Event) -> Result<u64> {
        debug!("Publishing event {} to topic {}", event.id, topic);

        let current_backlog = self.update_stats_and_get(topic, |stats| {
            stats.total_published += 1;
            stats.backlog_size = stats.backlog_size.saturating_add(1);
            stats.backlog_size
        });
        let over_threshold = current_backlog >= self.backpressure_threshold;

        // Snapshot matching subscribers so no map guard is held across an await
        let targets: Vec<Subscription> = match self.subscriptions.get(topic) {
            Some(subs) => subs
                .value()
                .iter()
                .filter(|sub| sub.event_types.is_empty() || sub.event_types.contains(&event.r#type))
                .cloned()
                .collect(),
            None => {
                debug!("No subscriptions for topic: {}", topic);
                self.update_stats(topic, |stats| {
                    stats.backlog_size = stats.backlog_size.saturating_sub(1);
                });
                return Ok(0);
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;
        for sub in &targets {
            match sub.qos {
                QoSLevel::QosRealtime => {
                    // Realtime mode: drop aggressively when backpressured, and drop on full queue
                    if over_threshold {
                        dropped += 1;
                        continue;
                    }
                    if sub.sender.try_send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dropped += 1;
                        warn!("Dropped realtime event for subscription {}", sub.id);
                    }
                }
                QoSLevel::QosBatched | QoSLevel::QosBackground => {
                    match sub.sender.send(event.clone()).await {
                        Ok(_) => delivered += 1,
                        Err(_) => {
                            dropped += 1;
                            warn!("Failed to send event to subscription {}", sub.id);
                        }
                    }
                }
            }
        }

        self.update_stats(topic, |stats| {
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
            stats.backlog_size = stats.backlog_size.saturating_sub(1);
        });

        Ok(delivered)
    }

    /// Subscribe to topic
    pub async fn subscribe(
        &self,
        topic: String,
        event_types: Vec<String>,
        qos: QoSLevel,
    ) -> Result<(String, mpsc::Receiver<Event>)> {
        let subscription_id = format!("sub_{}_{}", topic, next_event_id());
        let cap = match qos {
            QoSLevel::QosRealtime => 64,
            QoSLevel::QosBatched => 1024,
            QoSLevel::QosBackground => 4096,
        };
        let (tx, rx) = mpsc::channel(cap);

        let subscription = Subscription {
            id: subscription_id.clone(),
            event_types,
            qos,
            sender: tx,
        };

        self.subscriptions
            .entry(topic.clone())
            .or_default()
            .push(subscription);

        self.update_stats(&topic, |stats| {
            stats.active_subscriptions += 1;
        });

        info!(
            "Created subscription {} for topic {}",
            subscription_id, topic
        );
        Ok((subscription_id, rx))
    }

    /// Unsubscribe from topic
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut removed_from = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != subscription_id);
            if entry.value().len() != before {
                removed_from.push(entry.key().clone());
            }
        }
        for topic in removed_from {
            self.update_stats(&topic, |stats| {
                stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            });
        }

        info!("Unsubscribed {}", subscription_id);
        Ok(())
    }

    /// Get stats
    pub fn get_stats(&self, topic: &str) -> Option<EventBusStats> {
        self.stats.get(topic).map(|s| s.clone())
    }

    fn update_stats<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&mut EventBusStats),
    {
        let mut entry = self.stats.entry(topic.to_string()).or_default();
        f(entry.value_mut());
    }

    fn update_stats_and_get<F>(&self, topic: &str, f: F) -> usize
    where
        F: FnOnce(&mut EventBusStats) -> usize,
    {
        let mut entry = self.stats.entry(topic.to_string()).or_default();
        f(entry.value_mut())
    }
}

/// Time-based id with a process-wide counter so ids stay unique within one millisecond
fn next_event_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{}", chrono::Utc::now().timestamp_millis(), counter)
}
