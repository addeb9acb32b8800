use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

use crate::error::RouterError;
use crate::message::{InstanceId, Message, MessageId};

/// Bounded inbound buffer of one instance.
#[derive(Debug, Default)]
struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Notify,
}

impl Inbox {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the oldest message, or the first one answering `message_id`.
    fn take(&self, message_id: Option<MessageId>) -> Option<Message> {
        let mut queue = self.queue();
        match message_id {
            None => queue.pop_front(),
            Some(wanted) => {
                let index = queue.iter().position(|msg| msg.answers(wanted))?;
                queue.remove(index)
            }
        }
    }
}

/// Allocates instance and message identifiers and owns every instance's
/// inbound buffer.
///
/// Buffers hold at most `capacity` messages; enqueueing into a full buffer
/// discards the oldest message first.
#[derive(Debug)]
pub struct SessionRegistry {
    next_instance: AtomicU64,
    next_message: AtomicU64,
    inboxes: DashMap<InstanceId, Arc<Inbox>, ahash::RandomState>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_instance: AtomicU64::new(1),
            next_message: AtomicU64::new(1),
            inboxes: DashMap::default(),
            capacity: capacity.max(1),
        }
    }

    /// Allocate the next instance id and give it an empty buffer.
    pub fn register_instance(&self) -> InstanceId {
        let id = InstanceId::new(self.next_instance.fetch_add(1, Ordering::Relaxed));
        self.inboxes.insert(id, Arc::new(Inbox::default()));
        id
    }

    /// Drop an instance's buffer along with anything still queued in it.
    /// Later messages addressed to the instance are unroutable.
    pub fn remove_instance(&self, id: InstanceId) -> bool {
        self.inboxes.remove(&id).is_some()
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId::new(self.next_message.fetch_add(1, Ordering::Relaxed))
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.inboxes.contains_key(&id)
    }

    /// Number of messages waiting in an instance's buffer.
    pub fn pending(&self, id: InstanceId) -> usize {
        self.inboxes
            .get(&id)
            .map(|inbox| inbox.queue().len())
            .unwrap_or(0)
    }

    pub fn enqueue(&self, id: InstanceId, message: Message) -> Result<(), RouterError> {
        let inbox = self.inbox(id)?;
        {
            let mut queue = inbox.queue();
            queue.push_back(message);
            while queue.len() > self.capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!(instance_id = %id, dropped = %dropped, "Inbound buffer full, dropped oldest message");
                }
            }
        }
        inbox.arrived.notify_waiters();
        Ok(())
    }

    /// Take a message from an instance's buffer.
    ///
    /// Without `message_id` this pops the oldest message. With it, the first
    /// message answering that id (see [`Message::answers`]) is removed from
    /// wherever it sits in the buffer. When `block` is set the call waits
    /// for a qualifying message to arrive; otherwise it returns `None`.
    pub async fn dequeue(
        &self,
        id: InstanceId,
        message_id: Option<MessageId>,
        block: bool,
    ) -> Result<Option<Message>, RouterError> {
        let inbox = self.inbox(id)?;

        loop {
            // Register interest before looking so an enqueue between the
            // check and the await still wakes us.
            let arrived = inbox.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(message) = inbox.take(message_id) {
                return Ok(Some(message));
            }
            if !block {
                return Ok(None);
            }

            arrived.await;
        }
    }

    fn inbox(&self, id: InstanceId) -> Result<Arc<Inbox>, RouterError> {
        self.inboxes
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RouterError::UnknownInstance(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;
    use std::time::Duration;

    fn reply(to: InstanceId, kind: &str, id: u64, args: &str) -> Message {
        Message::new(to, kind, MessageId::new(id), args)
    }

    #[test]
    fn test_ids_are_sequential_and_independent() {
        let registry = SessionRegistry::new(10);
        assert_eq!(registry.register_instance(), InstanceId::new(1));
        assert_eq!(registry.register_instance(), InstanceId::new(2));
        assert_eq!(registry.next_message_id(), MessageId::new(1));
        assert_eq!(registry.next_message_id(), MessageId::new(2));
        assert_eq!(registry.register_instance(), InstanceId::new(3));
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let registry = Arc::new(SessionRegistry::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..100).map(|_| registry.next_message_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 800);
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest_ten_in_order() {
        let registry = SessionRegistry::new(10);
        let id = registry.register_instance();

        for n in 1..=15 {
            registry
                .enqueue(id, reply(id, kind::PLAYER_DONE, n, &n.to_string()))
                .unwrap();
        }
        assert_eq!(registry.pending(id), 10);

        let mut drained = Vec::new();
        while let Some(msg) = registry.dequeue(id, None, false).await.unwrap() {
            drained.push(msg.args);
        }
        let expected: Vec<String> = (6..=15).map(|n| n.to_string()).collect();
        assert_eq!(drained, expected);
    }

    #[tokio::test]
    async fn test_non_blocking_read_on_empty_buffer() {
        let registry = SessionRegistry::new(10);
        let id = registry.register_instance();
        assert!(registry.dequeue(id, None, false).await.unwrap().is_none());
        assert!(
            registry
                .dequeue(id, Some(MessageId::new(3)), false)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_correlated_read_skips_unrelated_messages() {
        let registry = SessionRegistry::new(10);
        let id = registry.register_instance();

        registry.enqueue(id, reply(id, kind::PLAYER_DONE, 5, "a")).unwrap();
        registry.enqueue(id, reply(id, kind::RECORD_DONE, 9, "b")).unwrap();

        let msg = registry
            .dequeue(id, Some(MessageId::new(9)), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.args, "b");

        // the unrelated message stays put
        assert_eq!(registry.pending(id), 1);
        assert!(
            registry
                .dequeue(id, Some(MessageId::new(9)), false)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_grammar_match_answers_any_correlated_read() {
        let registry = Arc::new(SessionRegistry::new(10));
        let id = registry.register_instance();

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.dequeue(id, Some(MessageId::new(42)), true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .enqueue(id, reply(id, kind::GRAMMAR_MATCH, 17, "yes"))
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.message_id, "17");
        assert_eq!(msg.args, "yes");
    }

    #[tokio::test]
    async fn test_blocking_fifo_read_waits_for_arrival() {
        let registry = Arc::new(SessionRegistry::new(10));
        let id = registry.register_instance();

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.dequeue(id, None, true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        registry.enqueue(id, reply(id, kind::SYNTHESIS_DONE, 1, "")).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(msg.is_kind(kind::SYNTHESIS_DONE));
    }

    #[tokio::test]
    async fn test_removed_instance_is_forgotten() {
        let registry = SessionRegistry::new(10);
        let id = registry.register_instance();
        registry
            .enqueue(id, reply(id, kind::WAKEUP, 1, "wakeup"))
            .unwrap();

        assert!(registry.remove_instance(id));
        assert!(!registry.contains(id));
        assert_eq!(registry.pending(id), 0);
        assert!(matches!(
            registry.enqueue(id, reply(id, kind::PLAY, 2, "")),
            Err(RouterError::UnknownInstance(_))
        ));
        assert!(!registry.remove_instance(id));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let registry = SessionRegistry::new(10);
        let ghost = InstanceId::new(99);
        assert!(matches!(
            registry.enqueue(ghost, reply(ghost, kind::PLAY, 1, "")),
            Err(RouterError::UnknownInstance(_))
        ));
        assert!(matches!(
            registry.dequeue(ghost, None, false).await,
            Err(RouterError::UnknownInstance(_))
        ));
    }
}
