//! Topic catalogue.
//!
//! Inbound patterns the engine subscribes to, outbound topics it publishes
//! to, and the dead-letter naming convention.

/// Lifecycle event patterns, one per trigger class.
pub const EMPLOYEE_PATTERNS: [&str; 4] = [
    "employee.onboard.*",
    "employee.exit.*",
    "employee.transfer.*",
    "employee.update.*",
];

/// Run control topics.
pub const RUN_PAUSE: &str = "workflow.run.pause";
pub const RUN_RESUME: &str = "workflow.run.resume";
pub const RUN_CANCEL: &str = "workflow.run.cancel";

/// Executor results.
pub const NODE_RESULT: &str = "node.execute.result";

/// Best-effort cancellation notices to executors.
pub const NODE_CANCEL: &str = "node.execute.cancel";

/// Audit / error-log events.
pub const AUDIT_EVENTS: &str = "audit.events";

/// Per-integration execution request topics.
pub const IDENTITY_EXECUTE: &str = "identity.execute";
pub const EMAIL_EXECUTE: &str = "email.execute";
pub const CALENDAR_EXECUTE: &str = "calendar.execute";
pub const SLACK_EXECUTE: &str = "slack.execute";
pub const DOCUMENT_EXECUTE: &str = "document.execute";
pub const AI_EXECUTE: &str = "ai.execute";
pub const WEBHOOK_EXECUTE: &str = "webhook.execute";
/// Engine-internal control nodes (delay, condition, parallel, compensation).
pub const WORKFLOW_CONTROL: &str = "workflow.control";

/// Every request topic, for executor-side subscription.
pub const REQUEST_TOPICS: [&str; 8] = [
    IDENTITY_EXECUTE,
    EMAIL_EXECUTE,
    CALENDAR_EXECUTE,
    SLACK_EXECUTE,
    DOCUMENT_EXECUTE,
    AI_EXECUTE,
    WEBHOOK_EXECUTE,
    WORKFLOW_CONTROL,
];

/// Dead-lettered messages from `topic` land here.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// Pattern matching every dead-letter topic.
pub const DLQ_PATTERN: &str = "*.dlq";

/// Messages dead-lettered this many times are quarantined instead of
/// re-submitted.
pub const QUARANTINE_THRESHOLD: u32 = 6;

/// Quarantined dead letters are parked here for operator review.
pub const QUARANTINE: &str = "dlq.quarantine";
