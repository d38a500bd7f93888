//! Topic registry - reference-counted server subscriptions
//!
//! A topic is on the wire iff its count is above zero and the transport is
//! connected. Subscribes made while disconnected are deferred; the transport
//! calls [`TopicRegistry::resubscribe_all`] on every (re)connection.

use std::collections::HashMap;

use shared_types::OutboundFrame;

use crate::transport::FrameSink;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Topic {0} has no active subscribers")]
    NotSubscribed(String),
}

/// Result of adding a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Count went 0 → 1
    First { sent: bool },
    Additional(usize),
}

/// Result of removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Count went 1 → 0
    Last { sent: bool },
    Remaining(usize),
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    counts: HashMap<String, usize>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: &str, sink: &dyn FrameSink) -> Acquired {
        let count = self.counts.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Acquired::Additional(*count);
        }

        let sent = sink.is_connected() && sink.push_frame(&OutboundFrame::subscribe(topic));
        if !sent {
            tracing::debug!(topic, "subscribe deferred until connected");
        }
        Acquired::First { sent }
    }

    pub fn unsubscribe(&mut self, topic: &str, sink: &dyn FrameSink) -> Result<Released, RegistryError> {
        let Some(count) = self.counts.get_mut(topic) else {
            tracing::warn!(topic, "unsubscribe without a matching subscribe ignored");
            return Err(RegistryError::NotSubscribed(topic.to_string()));
        };

        *count -= 1;
        if *count > 0 {
            return Ok(Released::Remaining(*count));
        }

        self.counts.remove(topic);
        let sent = sink.is_connected() && sink.push_frame(&OutboundFrame::unsubscribe(topic));
        Ok(Released::Last { sent })
    }

    /// Replay a subscribe frame for every topic with a live count. Returns how many were written.
    pub fn resubscribe_all(&self, sink: &dyn FrameSink) -> usize {
        self.active_topics()
            .into_iter()
            .filter(|topic| sink.push_frame(&OutboundFrame::subscribe(topic.as_str())))
            .count()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.counts.get(topic).copied().unwrap_or(0)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.count(topic) > 0
    }

    /// Topics with at least one subscriber, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.counts.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct RecordingSink {
        connected: Cell<bool>,
        frames: RefCell<Vec<OutboundFrame>>,
    }

    impl FrameSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected.get()
        }

        fn push_frame(&self, frame: &OutboundFrame) -> bool {
            self.frames.borrow_mut().push(frame.clone());
            true
        }
    }

    fn connected_sink() -> RecordingSink {
        let sink = RecordingSink::default();
        sink.connected.set(true);
        sink
    }

    #[test]
    fn test_n_subscribes_and_unsubscribes_send_one_frame_each() {
        let sink = connected_sink();
        let mut registry = TopicRegistry::new();

        for _ in 0..3 {
            registry.subscribe("srv-1", &sink);
        }
        assert_eq!(registry.count("srv-1"), 3);
        for _ in 0..3 {
            registry.unsubscribe("srv-1", &sink).unwrap();
        }

        assert_eq!(
            *sink.frames.borrow(),
            vec![
                OutboundFrame::subscribe("srv-1"),
                OutboundFrame::unsubscribe("srv-1")
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_subscribe_outcomes() {
        let sink = connected_sink();
        let mut registry = TopicRegistry::new();
        assert_eq!(registry.subscribe("a", &sink), Acquired::First { sent: true });
        assert_eq!(registry.subscribe("a", &sink), Acquired::Additional(2));
        assert_eq!(registry.unsubscribe("a", &sink), Ok(Released::Remaining(1)));
        assert_eq!(registry.unsubscribe("a", &sink), Ok(Released::Last { sent: true }));
    }

    #[test]
    fn test_subscribe_while_disconnected_is_deferred() {
        let sink = RecordingSink::default();
        let mut registry = TopicRegistry::new();

        assert_eq!(registry.subscribe("srv-1", &sink), Acquired::First { sent: false });
        assert!(sink.frames.borrow().is_empty());
        assert!(registry.is_subscribed("srv-1"));

        sink.connected.set(true);
        assert_eq!(registry.resubscribe_all(&sink), 1);
        assert_eq!(*sink.frames.borrow(), vec![OutboundFrame::subscribe("srv-1")]);
    }

    #[test]
    fn test_unsubscribe_beyond_count_is_rejected() {
        let sink = connected_sink();
        let mut registry = TopicRegistry::new();

        assert_eq!(
            registry.unsubscribe("ghost", &sink),
            Err(RegistryError::NotSubscribed("ghost".to_string()))
        );

        registry.subscribe("srv-1", &sink);
        registry.unsubscribe("srv-1", &sink).unwrap();
        assert!(registry.unsubscribe("srv-1", &sink).is_err());
        assert_eq!(registry.count("srv-1"), 0);
        assert_eq!(sink.frames.borrow().len(), 2);
    }

    #[test]
    fn test_resubscribe_all_covers_every_live_topic_once() {
        let sink = connected_sink();
        let mut registry = TopicRegistry::new();
        registry.subscribe("b", &sink);
        registry.subscribe("a", &sink);
        registry.subscribe("a", &sink);
        registry.subscribe("c", &sink);
        registry.unsubscribe("c", &sink).unwrap();
        sink.frames.borrow_mut().clear();

        assert_eq!(registry.resubscribe_all(&sink), 2);
        assert_eq!(
            *sink.frames.borrow(),
            vec![OutboundFrame::subscribe("a"), OutboundFrame::subscribe("b")]
        );
    }
}
