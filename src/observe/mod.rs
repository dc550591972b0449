//! Observability sink.
//!
//! Sessions and the dispatcher report lifecycle transitions and notification
//! failures as [`Event`]s. The server fans them out to tracing, to the
//! `metrics` facade, and in tests to a [`MemorySink`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::mcp::protocol::ErrorKind;
use crate::mcp::session::{SessionId, SessionState};

/// Something worth observing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SessionOpened {
        session: SessionId,
        at: DateTime<Utc>,
    },
    SessionTransition {
        session: SessionId,
        from: SessionState,
        to: SessionState,
        at: DateTime<Utc>,
    },
    NotificationFailed {
        session: SessionId,
        method: String,
        kind: ErrorKind,
        message: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn session_opened(session: SessionId) -> Self {
        Self::SessionOpened {
            session,
            at: Utc::now(),
        }
    }

    pub fn transition(session: SessionId, from: SessionState, to: SessionState) -> Self {
        Self::SessionTransition {
            session,
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn notification_failed(
        session: SessionId,
        method: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::NotificationFailed {
            session,
            method: method.into(),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn session(&self) -> &SessionId {
        match self {
            Self::SessionOpened { session, .. }
            | Self::SessionTransition { session, .. }
            | Self::NotificationFailed { session, .. } => session,
        }
    }
}

/// Receives events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::SessionOpened { session, .. } => info!(%session, "session opened"),
            Event::SessionTransition {
                session, from, to, ..
            } => debug!(%session, %from, %to, "session transition"),
            Event::NotificationFailed {
                session,
                method,
                kind,
                message,
                ..
            } => warn!(%session, %method, %kind, "notification failed: {}", message),
        }
    }
}

/// Records events through the `metrics` facade.
#[derive(Debug, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: Event) {
        match event {
            Event::SessionOpened { .. } => {
                metrics::counter!("doxie_sessions_opened_total").increment(1);
                metrics::gauge!("doxie_sessions_active").increment(1.0);
            }
            Event::SessionTransition { to, .. } => {
                metrics::counter!("doxie_session_transitions_total", "to" => to.as_str())
                    .increment(1);
                if to == SessionState::Closed {
                    metrics::gauge!("doxie_sessions_active").decrement(1.0);
                }
            }
            Event::NotificationFailed { kind, .. } => {
                metrics::counter!("doxie_notification_failures_total", "kind" => kind.as_str())
                    .increment(1);
            }
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// `(method, kind)` of every failed notification.
    pub fn notification_failures(&self) -> Vec<(String, ErrorKind)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::NotificationFailed { method, kind, .. } => Some((method, kind)),
                _ => None,
            })
            .collect()
    }

    /// `(from, to)` of every transition of one session, in order.
    pub fn transitions_for(&self, session: &SessionId) -> Vec<(SessionState, SessionState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::SessionTransition { session: s, from, to, .. } if &s == session => {
                    Some((from, to))
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// The sink the binary runs with.
pub fn default_sink(metrics: bool) -> Arc<dyn EventSink> {
    let fanout = FanoutSink::new().with(Arc::new(TracingSink));
    if metrics {
        Arc::new(fanout.with(Arc::new(MetricsSink)))
    } else {
        Arc::new(fanout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = Event::transition(SessionId::from("s1"), SessionState::Open, SessionState::Active);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "session_transition");
        assert_eq!(value["session"], "s1");
        assert_eq!(value["from"], "open");
        assert_eq!(value["to"], "active");
        assert!(value["at"].is_string());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.emit(Event::notification_failed(
            SessionId::from("s1"),
            "notifications/progress",
            ErrorKind::MethodNotFound,
            "no handler",
        ));

        assert_eq!(a.notification_failures().len(), 1);
        assert_eq!(b.events().len(), 1);
        assert_eq!(b.events()[0].session().as_str(), "s1");
    }

    #[test]
    fn test_transitions_filtered_by_session() {
        let sink = MemorySink::new();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        sink.emit(Event::transition(s1.clone(), SessionState::Open, SessionState::Active));
        sink.emit(Event::transition(s2.clone(), SessionState::Open, SessionState::Closing));
        sink.emit(Event::transition(s1.clone(), SessionState::Active, SessionState::Closing));

        assert_eq!(
            sink.transitions_for(&s1),
            vec![
                (SessionState::Open, SessionState::Active),
                (SessionState::Active, SessionState::Closing)
            ]
        );
        assert_eq!(sink.transitions_for(&s2).len(), 1);
    }

    #[test]
    fn test_metrics_sink_without_recorder_is_noop() {
        MetricsSink.emit(Event::session_opened(SessionId::stdio()));
    }
}
