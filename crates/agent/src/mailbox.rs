use courier_core::Message;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

struct Inner {
    queue: VecDeque<Message>,
    /// Taken by the owner and not yet fully processed.
    in_flight: Option<Message>,
}

/// Bounded FIFO inbox of one agent.
///
/// Producers wait for space; the single consumer marks what it takes as in
/// flight until it calls [`Mailbox::complete`], so a snapshot never loses a
/// message that was being worked on.
pub struct Mailbox {
    owner: String,
    capacity: usize,
    inner: Mutex<Inner>,
    items: Notify,
    space: Notify,
}

impl Mailbox {
    pub fn new(owner: &str, capacity: usize) -> Self {
        Self {
            owner: owner.to_string(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                in_flight: None,
            }),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `msg`, waiting while the mailbox is full.
    pub async fn push(&self, msg: Message) {
        loop {
            let space = self.space.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(msg);
                    self.items.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Append without waiting. Gives the message back when full.
    pub async fn try_push(&self, msg: Message) -> std::result::Result<(), Message> {
        let mut inner = self.inner.lock().await;
        if inner.queue.len() >= self.capacity {
            return Err(msg);
        }
        inner.queue.push_back(msg);
        self.items.notify_one();
        Ok(())
    }

    /// Take the next message, marking it in flight. `None` after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let items = self.items.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(msg) = inner.queue.pop_front() {
                    inner.in_flight = Some(msg.clone());
                    self.space.notify_one();
                    return Some(msg);
                }
            }
            if tokio::time::timeout_at(deadline, items).await.is_err() {
                return None;
            }
        }
    }

    /// The in-flight message has been fully handled.
    pub async fn complete(&self) {
        self.inner.lock().await.in_flight = None;
    }

    pub async fn in_flight(&self) -> Option<Message> {
        self.inner.lock().await.in_flight.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.queue.is_empty()
    }

    /// Queued messages with any in-flight message first. Nothing is removed.
    pub async fn contents(&self) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner
            .in_flight
            .iter()
            .chain(inner.queue.iter())
            .cloned()
            .collect()
    }

    /// Replace the contents with `messages`, in order. Capacity is not
    /// enforced so a restore never drops mail.
    pub async fn restore(&self, messages: Vec<Message>) {
        let mut inner = self.inner.lock().await;
        inner.queue = messages.into();
        inner.in_flight = None;
        if !inner.queue.is_empty() {
            self.items.notify_one();
        }
    }
}
