//! Registry of live WebSocket connections.
//!
//! A user may hold several connections at once; each one owns a bounded
//! outbound queue drained by its writer task. Delivery never waits on a
//! queue: a full queue drops the message for that connection only.

mod envelope;

pub use envelope::Envelope;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::{Role, UserId};

pub type ConnectionId = Uuid;

pub type Outbound = Arc<str>;

/// Identity of one registered connection, held by its connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug)]
struct Registered {
    id: ConnectionId,
    role: Role,
    tx: mpsc::Sender<Outbound>,
}

impl Registered {
    fn deliver(&self, user_id: &UserId, message: &Outbound) -> bool {
        match self.tx.try_send(Arc::clone(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, connection_id = %self.id, "Outbound queue full, dropping message");
                false
            }
            // Writer already gone; unregister is on its way.
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct HubInner {
    connections: DashMap<UserId, Vec<Registered>>,
    sessions: DashMap<UserId, Arc<Mutex<()>>>,
    queue_capacity: usize,
}

/// Exclusive hold on one user's connect/disconnect bookkeeping.
pub struct SessionGuard {
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
    inner: Arc<HubInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still refers to an idle gate.
        self.inner
            .sessions
            .remove_if(&self.user_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: DashMap::new(),
                sessions: DashMap::new(),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Serializes a user's connection setup and teardown, so a reconnect
    /// never interleaves with the work that follows a last disconnect.
    pub async fn session(&self, user_id: UserId) -> SessionGuard {
        let gate = self
            .inner
            .sessions
            .entry(user_id)
            .or_default()
            .value()
            .clone();
        let guard = gate.lock_owned().await;
        SessionGuard {
            user_id,
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Adds a connection and returns the receiving end of its outbound queue.
    pub fn register(&self, user_id: UserId, role: Role) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let connection = Connection {
            id: Uuid::new_v4(),
            user_id,
            role,
        };

        self.inner
            .connections
            .entry(user_id)
            .or_default()
            .push(Registered {
                id: connection.id,
                role,
                tx,
            });

        debug!(user_id = %user_id, connection_id = %connection.id, role = %role, "Connection registered");
        (connection, rx)
    }

    /// Removes the connection and returns how many the user still holds.
    /// Unregistering twice is a no-op.
    pub fn unregister(&self, connection: &Connection) -> usize {
        let remaining = match self.inner.connections.get_mut(&connection.user_id) {
            Some(mut registered) => {
                registered.retain(|r| r.id != connection.id);
                registered.len()
            }
            None => return 0,
        };

        if remaining == 0 {
            self.inner
                .connections
                .remove_if(&connection.user_id, |_, registered| registered.is_empty());
        }

        debug!(
            user_id = %connection.user_id,
            connection_id = %connection.id,
            remaining,
            "Connection unregistered"
        );
        remaining
    }

    /// Delivers to one specific connection, e.g. a reply to its own frame.
    pub fn send_to_connection(&self, connection: &Connection, envelope: &Envelope) -> bool {
        let Some(message) = encode(envelope) else {
            return false;
        };
        self.inner
            .connections
            .get(&connection.user_id)
            .and_then(|registered| {
                registered
                    .iter()
                    .find(|r| r.id == connection.id)
                    .map(|r| r.deliver(&connection.user_id, &message))
            })
            .unwrap_or(false)
    }

    /// Delivers to every connection of `user_id`; returns how many accepted it.
    pub fn send_to_user(&self, user_id: &UserId, envelope: &Envelope) -> usize {
        let Some(message) = encode(envelope) else {
            return 0;
        };
        self.inner
            .connections
            .get(user_id)
            .map(|registered| {
                registered
                    .iter()
                    .filter(|r| r.deliver(user_id, &message))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn send_to_role(&self, role: Role, envelope: &Envelope) -> usize {
        let Some(message) = encode(envelope) else {
            return 0;
        };
        self.fan_out(&message, |r| r.role == role)
    }

    pub fn broadcast_all(&self, envelope: &Envelope) -> usize {
        let Some(message) = encode(envelope) else {
            return 0;
        };
        self.fan_out(&message, |_| true)
    }

    fn fan_out(&self, message: &Outbound, include: impl Fn(&Registered) -> bool) -> usize {
        let mut delivered = 0;
        for entry in self.inner.connections.iter() {
            delivered += entry
                .value()
                .iter()
                .filter(|r| include(r))
                .filter(|r| r.deliver(entry.key(), message))
                .count();
        }
        delivered
    }
}

fn encode(envelope: &Envelope) -> Option<Outbound> {
    match envelope.encode() {
        Ok(message) => Some(message),
        Err(e) => {
            error!("Failed to encode {} envelope: {}", envelope.kind, e);
            None
        }
    }
}
