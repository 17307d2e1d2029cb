use crate::configuration::Configuration;
use crate::error::RelayError;
use crate::tokens::TokenStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Process-unique identifier of one accepted communicator socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a binding was removed from under its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Another socket authenticated as the same communicator.
    TakenOver(SocketAddr),
    /// A reload dropped the communicator, and with it the token used.
    Revoked,
}

/// Handle held in the registry, used to reach a connection's task.
#[derive(Debug)]
pub struct ConnHandle {
    /// Identifies the socket this handle belongs to (used for unbind guards).
    pub id: ConnId,
    /// Remote address of the socket.
    pub peer: SocketAddr,
    /// Writer queue of the connection; one task drains it per socket.
    pub tx: mpsc::Sender<String>,
    /// Fires when this binding is displaced or revoked.
    pub evict: oneshot::Sender<Eviction>,
}

/// Receiving halves owned by the connection task.
#[derive(Debug)]
pub struct ConnInbox {
    /// Envelopes to write to the socket.
    pub rx: mpsc::Receiver<String>,
    /// Eviction notice.
    pub evicted: oneshot::Receiver<Eviction>,
}

impl ConnHandle {
    /// Create a handle and the matching inbox, with `capacity` queued envelopes.
    #[must_use]
    pub fn new(peer: SocketAddr, capacity: usize) -> (Self, ConnInbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let (evict, evicted) = oneshot::channel();
        let handle = Self {
            id: ConnId::allocate(),
            peer,
            tx,
            evict,
        };
        (handle, ConnInbox { rx, evicted })
    }
}

/// Result of a best-effort [`ConnectionRegistry::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on the communicator's live socket.
    Delivered,
    /// No socket is bound for the communicator.
    NotConnected,
    /// The bound socket shut down before the envelope could be queued.
    Closed,
    /// The socket's queue is full; the envelope was discarded.
    Dropped,
}

impl SendOutcome {
    /// Metric label for this outcome.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::NotConnected => "not_connected",
            Self::Closed => "closed",
            Self::Dropped => "dropped",
        }
    }
}

/// Concurrent communicator name → live socket table.
pub struct ConnectionRegistry {
    routes: DashMap<String, ConnHandle>,
    tokens: Arc<TokenStore>,
}

impl ConnectionRegistry {
    /// Create an empty registry authenticating against `tokens`.
    #[must_use]
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self {
            routes: DashMap::new(),
            tokens,
        }
    }

    /// Resolve a communicator's bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unauthorized`] if the token is not UTF-8, is
    /// unknown, or belongs to a name that is not a communicator of `generation`.
    pub fn authenticate(&self, token: &[u8], generation: &Configuration) -> Result<String, RelayError> {
        let token = std::str::from_utf8(token).map_err(|_| RelayError::Unauthorized)?;
        let name = self
            .tokens
            .resolve_token(token.trim())
            .ok_or(RelayError::Unauthorized)?;
        if generation.communicator(&name).is_none() {
            return Err(RelayError::Unauthorized);
        }
        Ok(name)
    }

    /// Install `handle` for `name`, evicting any previous binding.
    ///
    /// The displaced connection is told who took over before the shard lock
    /// is released, so no sender observes the new binding ahead of the
    /// eviction. Returns the displaced peer's address, if any.
    pub fn bind(&self, name: &str, handle: ConnHandle) -> Option<SocketAddr> {
        let peer = handle.peer;
        match self.routes.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let old = entry.insert(handle);
                // the old task may already be gone, which is fine
                let _ = old.evict.send(Eviction::TakenOver(peer));
                Some(old.peer)
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        }
    }

    /// Drop the binding for `name` and tell its socket the credential is gone.
    ///
    /// Returns the peer that was cut off, if one was bound.
    pub fn revoke(&self, name: &str) -> Option<SocketAddr> {
        let (_, old) = self.routes.remove(name)?;
        let _ = old.evict.send(Eviction::Revoked);
        Some(old.peer)
    }

    /// Revoke every binding whose name is not a communicator of `generation`.
    ///
    /// Returns the revoked names.
    pub fn retain_communicators(&self, generation: &Configuration) -> Vec<String> {
        let stale: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| generation.communicator(entry.key()).is_none())
            .map(|entry| entry.key().clone())
            .collect();
        stale
            .into_iter()
            .filter(|name| self.revoke(name).is_some())
            .collect()
    }

    /// Remove the binding for `name` only if it still belongs to `id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unbind(&self, name: &str, id: ConnId) -> bool {
        self.routes.remove_if(name, |_k, v| v.id == id).is_some()
    }

    /// Queue `envelope` on the socket bound for `name` without waiting.
    ///
    /// A full queue drops the envelope rather than stalling the caller.
    pub fn send(&self, name: &str, envelope: String) -> SendOutcome {
        let Some(entry) = self.routes.get(name) else {
            return SendOutcome::NotConnected;
        };
        match entry.value().tx.try_send(envelope) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Returns `true` if a socket is bound for `name`.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Peer address of the socket bound for `name`.
    #[must_use]
    pub fn peer(&self, name: &str) -> Option<SocketAddr> {
        self.routes.get(name).map(|entry| entry.value().peer)
    }

    /// Number of bound communicators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no communicator is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
