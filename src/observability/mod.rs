//! Observability: structured logging, lifecycle events, counters
//!
//! # Principles
//!
//! 1. Observability is read-only and never changes control flow
//! 2. No background threads
//! 3. Deterministic output
//!
//! ```ignore
//! use xmlstore::observability::{Logger, Event, log_event_with_fields};
//!
//! Logger::info("INDEX_FLUSH", &[("keys", "42")]);
//! log_event_with_fields(Event::CollectionCreated, &[("path", "/db/a")]);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

/// Log a lifecycle event
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_warning() {
        Severity::Warn
    } else {
        Severity::Info
    };
    Logger::log(severity, event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::PoolOperating);
        log_event_with_fields(Event::CollectionCreated, &[("path", "/db/test")]);
    }
}
