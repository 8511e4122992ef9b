//! Outbound message queues shared between plugin producers and the writer.

use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::Message;

struct Queued {
    message: Message,
    order: u64,
}

#[derive(Default)]
struct Inner {
    /// One FIFO lane per plugin name (`""` for messages without one).
    lanes: HashMap<String, VecDeque<Queued>>,
    /// Messages that overflowed a POST, oldest first.
    retry: VecDeque<Message>,
    next_order: u64,
    queued: usize,
}

/// Priority queue plus retry queue for outbound messages.
///
/// Any thread may push; only the writer pops. Priority decides which
/// plugin's lane is served next, ties going to the earliest enqueued
/// message. Within a lane messages leave in the order they were pushed,
/// so a session's sequence numbers are never reordered.
#[derive(Default)]
pub struct Outbox {
    inner: Mutex<Inner>,
}

impl Outbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message on the primary queue.
    pub fn push(&self, message: Message) {
        let mut inner = self.lock();
        let order = inner.next_order;
        inner.next_order += 1;
        inner.queued += 1;
        let lane = message.plugin_name.clone().unwrap_or_default();
        inner
            .lanes
            .entry(lane)
            .or_default()
            .push_back(Queued { message, order });
    }

    /// Put a message back at the front of the retry queue.
    pub fn retry(&self, message: Message) {
        self.lock().retry.push_front(message);
    }

    /// Next message to send: retry queue first, then the best lane head.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.lock();
        if let Some(message) = inner.retry.pop_front() {
            return Some(message);
        }

        let lane = inner
            .lanes
            .iter()
            .filter_map(|(name, lane)| {
                lane.front()
                    .map(|q| (name, (q.message.priority(), Reverse(q.order))))
            })
            .max_by_key(|(_, key)| *key)
            .map(|(name, _)| name.clone())?;

        let queue = inner.lanes.get_mut(&lane)?;
        let queued = queue.pop_front()?;
        if queue.is_empty() {
            inner.lanes.remove(&lane);
        }
        inner.queued -= 1;
        Some(queued.message)
    }

    /// Messages waiting in the primary queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().queued
    }

    /// Messages waiting in the retry queue.
    #[must_use]
    pub fn retrying(&self) -> usize {
        self.lock().retry.len()
    }

    /// True when both queues are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.queued == 0 && inner.retry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{MessageType, PluginMessage, Priority};

    fn data(plugin: &str, seq: u64, priority: Priority) -> Message {
        Message::data(
            plugin,
            "sid",
            seq,
            PluginMessage::with_priority(json!(seq), priority),
            None,
        )
    }

    fn next(outbox: &Outbox) -> (String, Option<u64>) {
        let m = outbox.pop().unwrap();
        (m.plugin_name.unwrap_or_default(), m.session_seq)
    }

    #[test]
    fn test_priority_across_plugins() {
        let outbox = Outbox::new();
        outbox.push(data("a", 0, Priority::Low));
        outbox.push(data("b", 0, Priority::Normal));
        outbox.push(data("c", 0, Priority::High));

        assert_eq!(next(&outbox).0, "c");
        assert_eq!(next(&outbox).0, "b");
        assert_eq!(next(&outbox).0, "a");
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn test_fifo_tie_break() {
        let outbox = Outbox::new();
        outbox.push(data("b", 0, Priority::Normal));
        outbox.push(data("a", 0, Priority::Normal));

        assert_eq!(next(&outbox).0, "b");
        assert_eq!(next(&outbox).0, "a");
    }

    #[test]
    fn test_session_order_survives_priorities() {
        let outbox = Outbox::new();
        outbox.push(data("a", 0, Priority::Low));
        outbox.push(data("a", 1, Priority::High));
        outbox.push(data("b", 0, Priority::Normal));

        // a's head is low priority, so b goes first; a's seq order holds.
        assert_eq!(next(&outbox), ("b".into(), Some(0)));
        assert_eq!(next(&outbox), ("a".into(), Some(0)));
        assert_eq!(next(&outbox), ("a".into(), Some(1)));
    }

    #[test]
    fn test_retry_queue_takes_precedence() {
        let outbox = Outbox::new();
        outbox.push(Message::session_create_request("z"));
        outbox.retry(data("a", 1, Priority::Low));
        outbox.retry(data("a", 0, Priority::Low));

        assert_eq!(outbox.retrying(), 2);
        assert_eq!(next(&outbox), ("a".into(), Some(0)));
        assert_eq!(next(&outbox), ("a".into(), Some(1)));
        let m = outbox.pop().unwrap();
        assert_eq!(m.kind, MessageType::SessionCreateRequest);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_counts() {
        let outbox = Outbox::new();
        assert!(outbox.is_empty());
        outbox.push(data("a", 0, Priority::Normal));
        outbox.push(data("b", 0, Priority::Normal));
        assert_eq!(outbox.queued(), 2);
        outbox.pop();
        assert_eq!(outbox.queued(), 1);
        assert!(!outbox.is_empty());
    }
}
