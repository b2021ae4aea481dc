// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Topic-keyed publish/subscribe event bus (§4.1).
//!
//! Topics are session ids plus the distinguished [`ALL_TOPIC`]. Publishing
//! never blocks on a slow subscriber: each topic is backed by a
//! [`tokio::sync::broadcast`] channel, whose lagging receivers drop the
//! oldest unread events rather than stalling the publisher.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::events::AgentEvent;

/// The topic every subscriber implicitly also receives.
pub const ALL_TOPIC: &str = "*";

const TOPIC_CAPACITY: usize = 1024;

/// Process-wide shared pub/sub registry. Cheap to clone (wrap in `Arc`);
/// the only shared mutable state in the core besides the session
/// supervisor root (§9 "Global state").
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<AgentEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { topics: Mutex::new(HashMap::new()) }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<AgentEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Register for every subsequent event published to `topic`.
    /// Subscribing twice yields two independent receivers (and deliveries).
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<AgentEvent> {
        self.sender_for(topic).subscribe()
    }

    /// Deliver to every current subscriber of `topic` and of [`ALL_TOPIC`].
    /// Per-publisher order is preserved because both sends happen from the
    /// same caller in sequence. Errors (no receivers) are not surfaced —
    /// per §4.1 "delivery errors to one subscriber must never affect
    /// others or the publisher".
    pub fn publish(&self, topic: &str, event: AgentEvent) {
        let topic_tx = self.sender_for(topic);
        let _ = topic_tx.send(event.clone());
        if topic != ALL_TOPIC {
            let all_tx = self.sender_for(ALL_TOPIC);
            let _ = all_tx.send(event);
        }
    }

    /// Drop a topic's channel once nobody holds a sender/receiver for it.
    /// Unsubscribe is otherwise implicit: dropping the `Receiver` is
    /// idempotent cleanup by construction.
    pub fn prune(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(tx) = topics.get(topic) {
            if tx.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
    }
}
