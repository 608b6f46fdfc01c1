//! Consumer loop with dead-letter forwarding.
//!
//! A consumer drains one subscription, invoking an async handler per
//! message.  A handler failure is retried in place; once the budget is
//! spent the message is forwarded to the topic's DLQ with its attempt
//! count and origin preserved.  A separate DLQ processor re-submits or
//! quarantines dead letters.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::envelope::{DeadLetter, Envelope};
use crate::error::BusError;
use crate::topics::{dlq_topic, DLQ_PATTERN, QUARANTINE, QUARANTINE_THRESHOLD};
use crate::traits::{Bus, Delivery};

/// Tuning for one consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Total handler attempts per message before dead-lettering.
    pub handler_attempts: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { handler_attempts: 3 }
    }
}

/// Drain `pattern` as `group`, running `handler` per delivery, until the
/// shutdown signal flips or the subscription closes.
pub async fn run_consumer<F, Fut>(
    bus: Arc<dyn Bus>,
    pattern: &str,
    group: &str,
    options: ConsumerOptions,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) -> Result<(), BusError>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    let mut receiver = bus.subscribe(pattern, group).await?;
    info!(pattern, group, "consumer started");

    loop {
        let delivery = tokio::select! {
            delivery = receiver.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let mut last_error = String::new();
        let mut handled = false;
        for attempt in 1..=options.handler_attempts {
            match handler(delivery.clone()).await {
                Ok(()) => {
                    handled = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        topic = %delivery.topic,
                        attempt,
                        error = %err,
                        "message handler failed"
                    );
                    last_error = err;
                }
            }
        }

        if !handled {
            dead_letter(bus.as_ref(), &delivery, &last_error).await;
        }
    }

    info!(pattern, group, "consumer stopped");
    Ok(())
}

/// Forward a poisoned message to its topic's DLQ.
async fn dead_letter(bus: &dyn Bus, delivery: &Delivery, error: &str) {
    let attempt_count = delivery.envelope.metadata.attempt_count + 1;

    let dead = DeadLetter {
        original_topic: delivery.topic.clone(),
        attempt_count,
        error: error.to_string(),
        envelope: delivery.envelope.clone(),
    };

    let mut metadata = delivery.envelope.metadata.clone();
    metadata.attempt_count = attempt_count;
    metadata.original_topic = Some(delivery.topic.clone());

    let envelope = match Envelope::new("deadletter", &dead, metadata) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(topic = %delivery.topic, error = %err, "failed to encode dead letter");
            return;
        }
    };

    let target = dlq_topic(&delivery.topic);
    if let Err(err) = bus.publish(&target, &delivery.key, envelope).await {
        error!(topic = %target, error = %err, "failed to publish dead letter");
    }
}

/// Drain every DLQ: re-submit young dead letters to their original topic,
/// quarantine ones past the threshold.
pub async fn run_dlq_processor(
    bus: Arc<dyn Bus>,
    group: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let resubmit_bus = Arc::clone(&bus);
    run_consumer(
        bus,
        DLQ_PATTERN,
        group,
        ConsumerOptions { handler_attempts: 1 },
        shutdown,
        move |delivery| {
            let bus = Arc::clone(&resubmit_bus);
            async move {
                let dead: DeadLetter = delivery
                    .envelope
                    .payload_as()
                    .map_err(|err| err.to_string())?;

                if dead.attempt_count >= QUARANTINE_THRESHOLD {
                    warn!(
                        original_topic = %dead.original_topic,
                        attempt_count = dead.attempt_count,
                        "dead letter quarantined"
                    );
                    let quarantined = Envelope {
                        message_type: "deadletter.quarantined".to_string(),
                        payload: delivery.envelope.payload.clone(),
                        metadata: delivery.envelope.metadata.clone(),
                    };
                    return bus
                        .publish(QUARANTINE, &delivery.key, quarantined)
                        .await
                        .map_err(|err| err.to_string());
                }

                // Re-submit, carrying the accumulated attempt count so the
                // next dead-lettering moves it closer to quarantine.
                let mut envelope = dead.envelope.clone();
                envelope.metadata.attempt_count = dead.attempt_count;
                info!(
                    original_topic = %dead.original_topic,
                    attempt_count = dead.attempt_count,
                    "re-submitting dead letter"
                );
                bus.publish(&dead.original_topic, &delivery.key, envelope)
                    .await
                    .map_err(|err| err.to_string())
            }
        },
    )
    .await
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageMetadata;
    use crate::memory::InMemoryBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn envelope() -> Envelope {
        Envelope::new(
            "test.event",
            &json!({"n": 1}),
            MessageMetadata::new("corr", "org-1", "emp-1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failing_handler_dead_letters_after_retries() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let mut dlq_rx = bus.subscribe("jobs.dlq", "test").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let consumer_bus = Arc::clone(&bus);
        let consumer = tokio::spawn(async move {
            run_consumer(
                consumer_bus,
                "jobs",
                "workers",
                ConsumerOptions { handler_attempts: 3 },
                shutdown_rx,
                move |_delivery| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err("boom".to_string())
                    }
                },
            )
            .await
            .unwrap();
        });

        bus.publish("jobs", "org-1", envelope()).await.unwrap();

        let delivery = dlq_rx.recv().await.unwrap();
        let dead: DeadLetter = delivery.envelope.payload_as().unwrap();
        assert_eq!(dead.original_topic, "jobs");
        assert_eq!(dead.attempt_count, 1);
        assert_eq!(dead.error, "boom");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn dlq_processor_resubmits_below_threshold() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let mut jobs_rx = bus.subscribe("jobs", "workers").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor_bus = Arc::clone(&bus);
        let processor = tokio::spawn(async move {
            run_dlq_processor(processor_bus, "dlq", shutdown_rx)
                .await
                .unwrap();
        });

        let dead = DeadLetter {
            original_topic: "jobs".to_string(),
            attempt_count: 2,
            error: "boom".to_string(),
            envelope: envelope(),
        };
        let dlq_envelope = Envelope::new(
            "deadletter",
            &dead,
            MessageMetadata::new("corr", "org-1", "emp-1"),
        )
        .unwrap();
        bus.publish("jobs.dlq", "org-1", dlq_envelope).await.unwrap();

        let resubmitted = jobs_rx.recv().await.unwrap();
        assert_eq!(resubmitted.envelope.metadata.attempt_count, 2);

        shutdown_tx.send(true).unwrap();
        processor.await.unwrap();
    }

    #[tokio::test]
    async fn dlq_processor_quarantines_at_threshold() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let mut jobs_rx = bus.subscribe("jobs", "workers").await.unwrap();
        let mut quarantine_rx = bus.subscribe(QUARANTINE, "ops").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor_bus = Arc::clone(&bus);
        let processor = tokio::spawn(async move {
            run_dlq_processor(processor_bus, "dlq", shutdown_rx)
                .await
                .unwrap();
        });

        let dead = DeadLetter {
            original_topic: "jobs".to_string(),
            attempt_count: QUARANTINE_THRESHOLD,
            error: "boom".to_string(),
            envelope: envelope(),
        };
        let dlq_envelope = Envelope::new(
            "deadletter",
            &dead,
            MessageMetadata::new("corr", "org-1", "emp-1"),
        )
        .unwrap();
        bus.publish("jobs.dlq", "org-1", dlq_envelope).await.unwrap();

        assert!(quarantine_rx.recv().await.is_some());
        assert!(jobs_rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        processor.await.unwrap();
    }
}
