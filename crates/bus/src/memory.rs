//! In-memory `Bus` backend.
//!
//! Topics are fanned out to subscribers in-process over unbounded channels.
//! Group semantics match a broker: within a group the partition key picks
//! one subscriber (so one org's messages stay ordered on one consumer),
//! and every group receives its own copy.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::traits::{topic_matches, Bus, Delivery};

struct Subscriber {
    pattern: String,
    group: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition_index(key: &str, len: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % len as u64) as usize
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, envelope: Envelope) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock();
        // Closed receivers are pruned on the way through.
        subscribers.retain(|sub| !sub.sender.is_closed());

        // Collect matching subscribers per group, then deliver one copy per
        // group to the key-selected member.
        let mut groups: Vec<(&str, Vec<&Subscriber>)> = Vec::new();
        for sub in subscribers.iter() {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            match groups.iter_mut().find(|(group, _)| *group == sub.group) {
                Some((_, members)) => members.push(sub),
                None => groups.push((sub.group.as_str(), vec![sub])),
            }
        }

        for (group, members) in groups {
            let target = members[Self::partition_index(key, members.len())];
            let delivery = Delivery {
                topic: topic.to_string(),
                key: key.to_string(),
                envelope: envelope.clone(),
            };
            if target.sender.send(delivery).is_err() {
                debug!(topic, group, "subscriber closed during publish");
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            group: group.to_string(),
            sender,
        });
        Ok(receiver)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageMetadata;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            "test.event",
            &json!({"n": 1}),
            MessageMetadata::new("corr", "org-1", "emp-1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn each_group_receives_one_copy() {
        let bus = InMemoryBus::new();
        let mut engine_rx = bus.subscribe("employee.onboard.*", "engine").await.unwrap();
        let mut audit_rx = bus.subscribe("employee.onboard.*", "audit").await.unwrap();

        bus.publish("employee.onboard.started", "org-1", envelope())
            .await
            .unwrap();

        assert!(engine_rx.try_recv().is_ok());
        assert!(audit_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn within_a_group_one_member_receives() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("topic", "workers").await.unwrap();
        let mut b = bus.subscribe("topic", "workers").await.unwrap();

        bus.publish("topic", "org-1", envelope()).await.unwrap();

        let delivered = usize::from(a.try_recv().is_ok()) + usize::from(b.try_recv().is_ok());
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_member() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("topic", "workers").await.unwrap();
        let mut b = bus.subscribe("topic", "workers").await.unwrap();

        for _ in 0..10 {
            bus.publish("topic", "org-1", envelope()).await.unwrap();
        }

        let a_count = std::iter::from_fn(|| a.try_recv().ok()).count();
        let b_count = std::iter::from_fn(|| b.try_recv().ok()).count();
        assert!(
            (a_count == 10 && b_count == 0) || (a_count == 0 && b_count == 10),
            "one member owns the key: a={a_count} b={b_count}"
        );
    }

    #[tokio::test]
    async fn non_matching_pattern_receives_nothing() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("employee.exit.*", "engine").await.unwrap();

        bus.publish("employee.onboard.started", "org-1", envelope())
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }
}
