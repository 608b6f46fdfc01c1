//! Structured error logging and alerting.
//!
//! Every engine error flows through one logger task fed by a
//! fire-and-forget channel, so a failing store or bus can never recurse
//! into the error path that reports it.  The task emits each entry to
//! `tracing`, persists it (`error_log:*`), publishes it on `audit.events`,
//! and evaluates the alert rules.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use bus::{topics, Bus, Envelope, MessageMetadata};
use model::{Clock, ErrorCategory, ErrorLevel, ErrorLogEntry};
use store::StateStore;

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

type AlertPredicate = Box<dyn Fn(&ErrorLogEntry) -> bool + Send + Sync>;

/// A predicate over log entries with a per-rule cooldown.
pub struct AlertRule {
    pub name: &'static str,
    pub cooldown: Duration,
    predicate: AlertPredicate,
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

impl AlertRule {
    pub fn new(
        name: &'static str,
        cooldown: Duration,
        predicate: impl Fn(&ErrorLogEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            cooldown,
            predicate: Box::new(predicate),
            last_fired: Mutex::new(None),
        }
    }
}

/// Evaluates alert rules against the error stream.
pub struct AlertManager {
    rules: Vec<AlertRule>,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>, clock: Arc<dyn Clock>) -> Self {
        Self { rules, clock }
    }

    /// The platform's stock rules.  `error_rate_cooldown` tunes the
    /// noisiest rule; the others keep their fixed windows.
    pub fn with_default_rules(clock: Arc<dyn Clock>, error_rate_cooldown: std::time::Duration) -> Self {
        let error_rate_cooldown = Duration::from_std(error_rate_cooldown)
            .unwrap_or_else(|_| Duration::minutes(5));
        let rules = vec![
            AlertRule::new("high_error_rate", error_rate_cooldown, |entry| {
                matches!(entry.level, ErrorLevel::Warn | ErrorLevel::Error)
            }),
            AlertRule::new("workflow_failure", Duration::minutes(10), |entry| {
                entry.category == ErrorCategory::Workflow
            }),
            AlertRule::new("system_error", Duration::minutes(1), |entry| {
                entry.level == ErrorLevel::Fatal && entry.category == ErrorCategory::System
            }),
        ];
        Self::new(rules, clock)
    }

    /// Fire every matching rule whose cooldown has lapsed.  Returns the
    /// names of the rules that fired.
    pub fn evaluate(&self, entry: &ErrorLogEntry) -> Vec<&'static str> {
        let now = self.clock.now();
        let mut fired = Vec::new();
        for rule in &self.rules {
            if !(rule.predicate)(entry) {
                continue;
            }
            let mut last = rule.last_fired.lock();
            let cooling = last.map_or(false, |at| now - at < rule.cooldown);
            if cooling {
                continue;
            }
            *last = Some(now);
            warn!(
                alert = rule.name,
                code = %entry.code,
                category = ?entry.category,
                "alert rule fired"
            );
            fired.push(rule.name);
        }
        fired
    }
}

// ---------------------------------------------------------------------------
// Error logger
// ---------------------------------------------------------------------------

/// Cheap cloneable handle; dropping every handle drains and stops the task.
#[derive(Clone)]
pub struct ErrorLogger {
    sender: mpsc::UnboundedSender<ErrorLogEntry>,
}

impl ErrorLogger {
    /// Spawn the logger task.  Alerting is skipped when `alerts` is `None`.
    pub fn start(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn Bus>,
        alerts: Option<AlertManager>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ErrorLogEntry>();

        let task = tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                match entry.level {
                    ErrorLevel::Warn => warn!(
                        code = %entry.code,
                        category = ?entry.category,
                        "{}", entry.message
                    ),
                    _ => error!(
                        code = %entry.code,
                        category = ?entry.category,
                        level = ?entry.level,
                        "{}", entry.message
                    ),
                }

                if let Err(err) = store.append_error_log(&entry).await {
                    warn!(error = %err, "error log entry not persisted");
                }

                let metadata = MessageMetadata::new(entry.id.to_string(), "", "");
                match Envelope::new("error.logged", &entry, metadata) {
                    Ok(envelope) => {
                        if let Err(err) = bus.publish(topics::AUDIT_EVENTS, "", envelope).await {
                            warn!(error = %err, "error log entry not published");
                        }
                    }
                    Err(err) => warn!(error = %err, "error log entry not encodable"),
                }

                if let Some(alerts) = &alerts {
                    alerts.evaluate(&entry);
                }
            }
        });

        (Self { sender }, task)
    }

    /// Fire-and-forget; a stopped logger drops the entry silently.
    pub fn report(&self, entry: ErrorLogEntry) {
        let _ = self.sender.send(entry);
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use bus::InMemoryBus;
    use model::{ManualClock, SystemClock};
    use store::MemoryStore;

    fn entry(level: ErrorLevel, category: ErrorCategory) -> ErrorLogEntry {
        ErrorLogEntry::new(level, category, "TEST_CODE", "test message")
    }

    #[test]
    fn rules_fire_and_respect_cooldown() {
        let clock = Arc::new(ManualClock::starting_now());
        let alerts =
            AlertManager::with_default_rules(clock.clone(), std::time::Duration::from_secs(300));

        let fired = alerts.evaluate(&entry(ErrorLevel::Fatal, ErrorCategory::System));
        assert!(fired.contains(&"system_error"));
        assert!(fired.contains(&"high_error_rate"));

        // Inside the 1-minute cooldown nothing re-fires.
        assert!(alerts
            .evaluate(&entry(ErrorLevel::Fatal, ErrorCategory::System))
            .is_empty());

        clock.advance_millis(61_000);
        let fired = alerts.evaluate(&entry(ErrorLevel::Fatal, ErrorCategory::System));
        assert!(fired.contains(&"system_error"));
        // high_error_rate has a 5-minute cooldown and stays quiet.
        assert!(!fired.contains(&"high_error_rate"));
    }

    #[test]
    fn workflow_rule_matches_category_only() {
        let alerts = AlertManager::with_default_rules(
            Arc::new(SystemClock),
            std::time::Duration::from_secs(300),
        );
        let fired = alerts.evaluate(&entry(ErrorLevel::Error, ErrorCategory::Workflow));
        assert!(fired.contains(&"workflow_failure"));

        let fired = alerts.evaluate(&entry(ErrorLevel::Error, ErrorCategory::Node));
        assert!(!fired.contains(&"workflow_failure"));
    }

    #[tokio::test]
    async fn logger_persists_and_publishes_entries() {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(Default::default(), clock.clone()));
        let bus = Arc::new(InMemoryBus::new());
        let mut audit_rx = bus.subscribe(topics::AUDIT_EVENTS, "test").await.unwrap();

        let (logger, task) = ErrorLogger::start(store, bus.clone(), None);
        logger.report(entry(ErrorLevel::Error, ErrorCategory::Node));

        let delivery = audit_rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.message_type, "error.logged");
        let logged: ErrorLogEntry = delivery.envelope.payload_as().unwrap();
        assert_eq!(logged.code, "TEST_CODE");

        drop(logger);
        task.await.unwrap();
    }
}
