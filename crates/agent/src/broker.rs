use courier_core::Message;
use courier_storage::AuditLogger;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::mailbox::Mailbox;

struct Registration {
    mailbox: Arc<Mailbox>,
    description: String,
}

/// The post office: routes mail between registered participants.
///
/// `dispatch` never blocks; it appends to an unbounded queue that [`run`]
/// drains into the recipients' bounded mailboxes, one message at a time, so
/// each recipient sees mail in dispatch order.
///
/// [`run`]: PostOffice::run
pub struct PostOffice {
    directory: RwLock<HashMap<String, Registration>>,
    queue: Mutex<VecDeque<Message>>,
    /// Popped from the queue, waiting for space in its recipient's mailbox.
    in_transit: Mutex<Option<Message>>,
    queued: Notify,
    paused: AtomicBool,
    audit: Option<AuditLogger>,
    warn_depth: usize,
}

impl PostOffice {
    pub fn new(audit: Option<AuditLogger>, warn_depth: usize) -> Self {
        Self {
            directory: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            in_transit: Mutex::new(None),
            queued: Notify::new(),
            paused: AtomicBool::new(false),
            audit,
            warn_depth,
        }
    }

    /// Register a participant (agent or external endpoint such as `User`).
    /// Re-registering a name replaces its mailbox.
    pub async fn register(&self, name: &str, description: &str, capacity: usize) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(name, capacity));
        let previous = self.directory.write().await.insert(
            name.to_string(),
            Registration {
                mailbox: mailbox.clone(),
                description: description.to_string(),
            },
        );
        if previous.is_some() {
            warn!(name = %name, "Participant re-registered, old mailbox detached");
        } else {
            info!(name = %name, capacity, "Participant registered");
        }
        mailbox
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<Mailbox>> {
        let removed = self.directory.write().await.remove(name);
        if removed.is_some() {
            info!(name = %name, "Participant unregistered");
        }
        removed.map(|r| r.mailbox)
    }

    pub async fn mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.directory.read().await.get(name).map(|r| r.mailbox.clone())
    }

    /// Every registered `(name, description)`, sorted by name.
    pub async fn contacts(&self) -> Vec<(String, String)> {
        let mut contacts: Vec<(String, String)> = self
            .directory
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.description.clone()))
            .collect();
        contacts.sort();
        contacts
    }

    /// Accept `msg` for delivery. Never blocks on the recipient.
    pub async fn dispatch(&self, msg: Message) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_dispatched(&msg) {
                warn!(message = %msg.id, error = %e, "Failed to audit dispatch");
            }
        }
        debug!(
            id = %msg.id,
            from = %msg.sender,
            to = %msg.recipient,
            correlation = msg.correlation_id.as_deref().unwrap_or("-"),
            "Mail dispatched"
        );
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.push_back(msg);
            queue.len()
        };
        if depth > self.warn_depth {
            warn!(depth, threshold = self.warn_depth, "Post office queue is backing up");
        }
        self.queued.notify_one();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Post office paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.queued.notify_one();
        info!("Post office resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Remove and return every queued, undelivered message.
    pub async fn take_undelivered(&self) -> Vec<Message> {
        self.queue.lock().await.drain(..).collect()
    }

    /// Copy of the mail not yet in any mailbox, the message in transit first.
    ///
    /// Both slots are read under the transit lock, which the delivery loop
    /// also holds while moving a message from the queue into transit.
    pub async fn undelivered(&self) -> Vec<Message> {
        let in_transit = self.in_transit.lock().await;
        let mut pending: Vec<Message> = in_transit.iter().cloned().collect();
        pending.extend(self.queue.lock().await.iter().cloned());
        pending
    }

    /// Put `messages` back at the head of the queue, ahead of newer mail.
    pub async fn restore_undelivered(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().await;
        for msg in messages.into_iter().rev() {
            queue.push_front(msg);
        }
        drop(queue);
        self.queued.notify_one();
    }

    /// Pop the next message and mark it in transit in one step.
    async fn next_message(&self) -> Option<Message> {
        if self.is_paused() {
            return None;
        }
        let mut in_transit = self.in_transit.lock().await;
        let msg = self.queue.lock().await.pop_front()?;
        *in_transit = Some(msg.clone());
        Some(msg)
    }

    /// Clear the transit slot, putting `requeue` back at the head of the queue.
    async fn settle(&self, requeue: Option<Message>) {
        let mut in_transit = self.in_transit.lock().await;
        if let Some(msg) = requeue {
            self.queue.lock().await.push_front(msg);
        }
        *in_transit = None;
    }

    /// Hand `msg` to its recipient, waiting for mailbox space. Returns the
    /// message when shutdown interrupts the wait.
    async fn deliver(
        &self,
        msg: Message,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<Message> {
        let Some(mailbox) = self.mailbox(&msg.recipient).await else {
            warn!(id = %msg.id, to = %msg.recipient, "Unknown recipient, dropping mail");
            if let Some(audit) = &self.audit {
                if let Err(e) = audit.log_dropped(&msg, "unknown recipient") {
                    warn!(message = %msg.id, error = %e, "Failed to audit drop");
                }
            }
            return None;
        };

        tokio::select! {
            _ = mailbox.push(msg.clone()) => {
                if let Some(audit) = &self.audit {
                    if let Err(e) = audit.log_delivered(&msg) {
                        warn!(message = %msg.id, error = %e, "Failed to audit delivery");
                    }
                }
                debug!(id = %msg.id, to = %msg.recipient, "Mail delivered");
                None
            }
            _ = shutdown.recv() => Some(msg),
        }
    }

    /// Drain the queue into mailboxes until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Post office started");
        loop {
            let wake = self.queued.notified();
            if let Some(msg) = self.next_message().await {
                let undelivered = self.deliver(msg, &mut shutdown).await;
                let interrupted = undelivered.is_some();
                self.settle(undelivered).await;
                if interrupted {
                    break;
                }
                continue;
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = wake => {}
            }
        }
        let undelivered = self.queue_len().await;
        info!(undelivered, "Post office stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Paths;
    use std::time::Duration;
    use tempfile::TempDir;

    fn mail(to: &str, id: &str) -> Message {
        Message::new("User", to, "", id).with_id(id)
    }

    async fn ids(mailbox: &Mailbox) -> Vec<String> {
        mailbox.contents().await.into_iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn test_routes_in_order_and_drops_unknown() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLogger::new(Paths::with_base(dir.path().to_path_buf()));
        let office = Arc::new(PostOffice::new(Some(audit), 10));
        let coder = office.register("Coder", "writes code", 8).await;

        office.dispatch(mail("Coder", "1")).await;
        office.dispatch(mail("Nobody", "2")).await;
        office.dispatch(mail("Coder", "3")).await;

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let office = office.clone();
            tokio::spawn(async move { office.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ids(&coder).await, vec!["1", "3"]);

        let _ = tx.send(());
        runner.await.unwrap();

        let reader = AuditLogger::new(Paths::with_base(dir.path().to_path_buf()));
        let events = reader.read_today().unwrap();
        assert_eq!(events.len(), 3 + 2 + 1);
    }

    #[tokio::test]
    async fn test_pause_holds_mail() {
        let office = Arc::new(PostOffice::new(None, 10));
        let coder = office.register("Coder", "", 8).await;
        office.pause();

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let office = office.clone();
            tokio::spawn(async move { office.run(rx).await })
        };
        office.dispatch(mail("Coder", "1")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(coder.is_empty().await);
        assert_eq!(office.queue_len().await, 1);

        office.resume();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ids(&coder).await, vec!["1"]);

        let _ = tx.send(());
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_keeps_blocked_mail() {
        let office = Arc::new(PostOffice::new(None, 10));
        office.register("Coder", "", 1).await;
        office.dispatch(mail("Coder", "1")).await;
        office.dispatch(mail("Coder", "2")).await;

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let office = office.clone();
            tokio::spawn(async move { office.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = tx.send(());
        runner.await.unwrap();

        let left: Vec<String> = office.take_undelivered().await.into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec!["2"]);
    }

    #[tokio::test]
    async fn test_restore_undelivered_goes_first() {
        let office = PostOffice::new(None, 10);
        office.dispatch(mail("Coder", "new")).await;
        office
            .restore_undelivered(vec![mail("Coder", "old1"), mail("Coder", "old2")])
            .await;
        let order: Vec<String> = office.take_undelivered().await.into_iter().map(|m| m.id).collect();
        assert_eq!(order, vec!["old1", "old2", "new"]);
    }

    #[tokio::test]
    async fn test_contacts_sorted() {
        let office = PostOffice::new(None, 10);
        office.register("User", "the operator", 4).await;
        office.register("Coder", "writes code", 4).await;
        assert_eq!(
            office.contacts().await,
            vec![
                ("Coder".to_string(), "writes code".to_string()),
                ("User".to_string(), "the operator".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_undelivered_includes_mail_in_transit() {
        let office = Arc::new(PostOffice::new(None, 10));
        let coder = office.register("Coder", "", 1).await;
        for id in ["1", "2", "3"] {
            office.dispatch(mail("Coder", id)).await;
        }

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let office = office.clone();
            tokio::spawn(async move { office.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ids(&coder).await, vec!["1"]);
        let pending: Vec<String> = office.undelivered().await.into_iter().map(|m| m.id).collect();
        assert_eq!(pending, vec!["2", "3"]);
        // Copying leaves the queue intact.
        assert_eq!(office.queue_len().await, 1);

        tx.send(()).unwrap();
        runner.await.unwrap();
        let left: Vec<String> = office.take_undelivered().await.into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec!["2", "3"]);
    }
}
