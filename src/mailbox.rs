//! # Long-Poll Mailbox
//!
//! Per-client ordered queue for workers that cannot accept inbound
//! connections. Ids are monotonic per client; delivery order equals push
//! order. A poll with nothing pending parks until a push arrives or the
//! long-poll window elapses, whichever comes first.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::MailboxMessage;

const DELIVERED_HISTORY: usize = 100;

struct ClientBox {
    last_id: u64,
    undelivered: VecDeque<MailboxMessage>,
    delivered: VecDeque<MailboxMessage>,
    notify: Arc<Notify>,
}

impl ClientBox {
    fn new() -> Self {
        Self {
            last_id: 0,
            undelivered: VecDeque::new(),
            delivered: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// The node-local mailbox for every long-poll client.
pub struct Mailbox {
    clients: Mutex<HashMap<String, ClientBox>>,
    lp_timeout: Duration,
}

impl Mailbox {
    pub fn new(lp_timeout_secs: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            lp_timeout: Duration::from_secs(lp_timeout_secs),
        }
    }

    /// Ensure a client queue exists.
    pub fn add_client(&self, client_id: &str) {
        self.clients
            .lock()
            .entry(client_id.to_string())
            .or_insert_with(ClientBox::new);
    }

    /// Enqueue a message and wake any parked poller. Returns the message id.
    pub fn push(&self, sender: &str, client_id: &str, payload: Value) -> u64 {
        let (id, notify) = {
            let mut clients = self.clients.lock();
            let client = clients
                .entry(client_id.to_string())
                .or_insert_with(ClientBox::new);
            client.last_id += 1;
            let message = MailboxMessage {
                id: client.last_id,
                sender: sender.to_string(),
                payload,
            };
            debug!("Mailbox push {} -> {} (id {})", sender, client_id, message.id);
            client.undelivered.push_back(message);
            (client.last_id, Arc::clone(&client.notify))
        };
        notify.notify_waiters();
        id
    }

    /// Drain messages with `id > last_id`, reclassifying them as delivered.
    fn take_pending(&self, client_id: &str, last_id: u64) -> (Vec<MailboxMessage>, Arc<Notify>) {
        let mut clients = self.clients.lock();
        let client = clients
            .entry(client_id.to_string())
            .or_insert_with(ClientBox::new);

        let mut batch = Vec::new();
        while let Some(front) = client.undelivered.front() {
            if front.id > last_id {
                let message = client.undelivered.pop_front().unwrap();
                client.delivered.push_back(message.clone());
                batch.push(message);
            } else {
                // Stale entry the client already acknowledged.
                client.undelivered.pop_front();
            }
        }
        while client.delivered.len() > DELIVERED_HISTORY {
            client.delivered.pop_front();
        }
        (batch, Arc::clone(&client.notify))
    }

    /// Long-poll: return pending messages, or park until a push or the
    /// timeout. Cancellation returns whatever is pending (possibly empty).
    pub async fn poll(
        &self,
        client_id: &str,
        last_id: u64,
        cancel: &CancellationToken,
    ) -> Vec<MailboxMessage> {
        let deadline = tokio::time::Instant::now() + self.lp_timeout;

        loop {
            let (batch, notify) = self.take_pending(client_id, last_id);
            if !batch.is_empty() {
                return batch;
            }

            let notified = notify.notified();
            tokio::pin!(notified);

            // Re-check after registering interest so a concurrent push
            // between the drain and the park is not lost.
            let (batch, _) = self.take_pending(client_id, last_id);
            if !batch.is_empty() {
                return batch;
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
                _ = cancel.cancelled() => return Vec::new(),
            }
        }
    }

    /// Known clients and their queue depths.
    pub fn clients(&self) -> Value {
        let clients = self.clients.lock();
        let listing: serde_json::Map<String, Value> = clients
            .iter()
            .map(|(id, client)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "last_id": client.last_id,
                        "undelivered": client.undelivered.len(),
                        "delivered": client.delivered.len(),
                    }),
                )
            })
            .collect();
        Value::Object(listing)
    }
}
