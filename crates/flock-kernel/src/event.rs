//! Human-readable rollout events and the sink they are published to.
//!
//! Events are fire-and-forget: [Notifier::publish] never fails and never
//! blocks orchestration. A sink error is logged and swallowed.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlockError;
use crate::identity::TraceId;

/// Default upper bound on a published message, in bytes.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 10_000;

const SNIP_SEPARATOR: &str = "\n\n...<snip>...\n\n";

/// Tag attached to an event so dashboards can filter rollout history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTag {
    Swarm,
    Build,
    Deploy,
    Uptest,
    Route,
    Proc,
    Deleted,
    Wait,
    Scheduled,
    Warning,
    Debug,
    Done,
    Failed,
    Success,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::Swarm => "swarm",
            EventTag::Build => "build",
            EventTag::Deploy => "deploy",
            EventTag::Uptest => "uptest",
            EventTag::Route => "route",
            EventTag::Proc => "proc",
            EventTag::Deleted => "deleted",
            EventTag::Wait => "wait",
            EventTag::Scheduled => "scheduled",
            EventTag::Warning => "warning",
            EventTag::Debug => "debug",
            EventTag::Done => "done",
            EventTag::Failed => "failed",
            EventTag::Success => "success",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published status notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub message: String,
    pub tags: Vec<EventTag>,
    pub trace_id: Option<TraceId>,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn has_tag(&self, tag: EventTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Destination for rollout events (pubsub channel, dashboard feed, ...).
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<(), FlockError>;
}

/// Sink that keeps every event in memory; used by tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<Event>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .read()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events carrying every tag in `tags`.
    pub fn with_tags(&self, tags: &[EventTag]) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| tags.iter().all(|tag| event.has_tag(*tag)))
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: &Event) -> Result<(), FlockError> {
        self.events
            .write()
            .map_err(|_| FlockError::Store("event sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Sink that only writes events to the tracing log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &Event) -> Result<(), FlockError> {
        let tags: Vec<&str> = event.tags.iter().map(EventTag::as_str).collect();
        tracing::info!(
            trace_id = event.trace_id.as_deref().unwrap_or(""),
            tags = ?tags,
            "{}: {}",
            event.title,
            event.message
        );
        Ok(())
    }
}

/// Publishing front-end shared by all rollout tasks.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
    max_message_len: usize,
    debug: bool,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            debug: false,
        }
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Log and publish an event. Sink failures are logged, never returned.
    pub fn publish(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        tags: &[EventTag],
        trace_id: Option<&str>,
    ) {
        let message = trim_message(&message.into(), self.max_message_len);
        tracing::info!("{}", message);
        let event = Event {
            title: title.into(),
            message,
            tags: tags.to_vec(),
            trace_id: trace_id.map(str::to_string),
            published_at: Utc::now(),
        };
        if let Err(err) = self.sink.publish(&event) {
            tracing::warn!("event publish failed for '{}': {}", event.title, err);
        }
    }

    /// Publish a `debug` event; dropped unless debug events are enabled.
    pub fn debug(&self, title: impl Into<String>, message: impl Into<String>) {
        if self.debug {
            self.publish(title, message, &[EventTag::Debug], None);
        }
    }
}

/// Keep the head and tail of an oversized message.
pub fn trim_message(message: &str, max_len: usize) -> String {
    if message.len() < max_len {
        return message.to_string();
    }
    let half = max_len / 2;
    let mut head_end = half.min(message.len());
    while !message.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = message.len().saturating_sub(half);
    while !message.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}{}{}",
        &message[..head_end],
        SNIP_SEPARATOR,
        &message[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn publish(&self, _event: &Event) -> Result<(), FlockError> {
            Err(FlockError::Store("pubsub down".into()))
        }
    }

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(trim_message("hello", 10), "hello");
    }

    #[test]
    fn long_messages_keep_head_and_tail() {
        let message = format!("{}{}", "a".repeat(10), "b".repeat(10));
        let trimmed = trim_message(&message, 10);
        assert_eq!(trimmed, format!("aaaaa{}bbbbb", SNIP_SEPARATOR));
    }

    #[test]
    fn trimming_respects_char_boundaries() {
        let message = "é".repeat(20);
        let trimmed = trim_message(&message, 9);
        assert!(trimmed.contains("<snip>"));
        assert!(trimmed.starts_with('é'));
    }

    #[test]
    fn publish_swallows_sink_failures() {
        let notifier = Notifier::new(Arc::new(FailingSink));
        notifier.publish("title", "message", &[EventTag::Deploy], Some("trace"));
    }

    #[test]
    fn debug_events_are_gated() {
        let sink = InMemoryEventSink::new();
        let quiet = Notifier::new(Arc::new(sink.clone()));
        quiet.debug("swarm", "release");
        assert!(sink.events().is_empty());

        let loud = Notifier::new(Arc::new(sink.clone())).with_debug(true);
        loud.debug("swarm", "release");
        assert_eq!(sink.with_tags(&[EventTag::Debug]).len(), 1);
    }

    #[test]
    fn tags_serialize_lowercase() {
        let json = serde_json::to_string(&[EventTag::Failed, EventTag::Uptest]).unwrap();
        assert_eq!(json, r#"["failed","uptest"]"#);
    }
}
