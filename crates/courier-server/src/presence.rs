//! Presence registry: which users are reachable, and through which live
//! connections.
//!
//! Each connection owns a bounded outbound queue drained by its writer task;
//! the registry only keeps the sending half. Writes never block: a full
//! queue drops the frame for that connection, a closed queue removes the
//! connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use courier_shared::types::{UserId, UserProfile};

/// Identifies one connection among a user's connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl std::fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    fn try_send(&self, frame: &str) -> SendOutcome {
        match self.tx.try_send(frame.to_string()) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Delivered,
    Dropped,
    Closed,
}

struct PresenceEntry {
    profile: UserProfile,
    connections: HashMap<ConnectionToken, ConnectionHandle>,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<UserId, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Re-using a token replaces the handle held for it.
    /// Returns `true` when the user just came online.
    pub async fn connect(
        &self,
        profile: UserProfile,
        token: ConnectionToken,
        handle: ConnectionHandle,
    ) -> bool {
        let user = profile.id;
        let mut entries = self.entries.write().await;

        let came_online = !entries.contains_key(&user);
        let entry = entries.entry(user).or_insert_with(|| PresenceEntry {
            profile: profile.clone(),
            connections: HashMap::new(),
        });
        entry.profile = profile;
        if entry.connections.insert(token.clone(), handle).is_some() {
            warn!(user = %user, connection = %token, "Connection token reused, replacing handle");
        }

        info!(
            user = %user,
            connection = %token,
            connections = entry.connections.len(),
            "Connection registered"
        );
        if came_online {
            info!(user = %user, online = entries.len(), "User online");
        }

        came_online
    }

    /// Remove a connection. Returns `true` when the user has no connection
    /// left afterwards.
    pub async fn disconnect(&self, user: UserId, token: &ConnectionToken) -> bool {
        let mut entries = self.entries.write().await;

        let Some(entry) = entries.get_mut(&user) else {
            // Already pruned after its queue closed.
            return true;
        };
        entry.connections.remove(token);
        debug!(user = %user, connection = %token, "Connection removed");

        if entry.connections.is_empty() {
            entries.remove(&user);
            info!(user = %user, online = entries.len(), "User offline");
            return true;
        }
        false
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.entries.read().await.contains_key(&user)
    }

    pub async fn connections(&self, user: UserId) -> Vec<ConnectionToken> {
        let entries = self.entries.read().await;
        let mut tokens: Vec<ConnectionToken> = entries
            .get(&user)
            .map(|e| e.connections.keys().cloned().collect())
            .unwrap_or_default();
        tokens.sort();
        tokens
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.read().await.keys().copied().collect();
        users.sort();
        users
    }

    /// Profile snapshot taken when the user connected.
    pub async fn profile(&self, user: UserId) -> Option<UserProfile> {
        self.entries
            .read()
            .await
            .get(&user)
            .map(|e| e.profile.clone())
    }

    /// Write a frame to every connection of `user`. Returns how many
    /// connections accepted it.
    pub async fn send_to_user(&self, user: UserId, frame: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let entries = self.entries.read().await;
            let Some(entry) = entries.get(&user) else {
                return 0;
            };
            for (token, handle) in &entry.connections {
                match handle.try_send(frame) {
                    SendOutcome::Delivered => delivered += 1,
                    SendOutcome::Dropped => {
                        debug!(user = %user, connection = %token, "Dropping frame for slow connection");
                    }
                    SendOutcome::Closed => closed.push(token.clone()),
                }
            }
        }

        if !closed.is_empty() {
            self.prune(user, &closed).await;
        }
        delivered
    }

    /// Write a frame to a single connection. Returns whether it was accepted.
    pub async fn send_to_connection(
        &self,
        user: UserId,
        token: &ConnectionToken,
        frame: &str,
    ) -> bool {
        let outcome = {
            let entries = self.entries.read().await;
            match entries.get(&user).and_then(|e| e.connections.get(token)) {
                Some(handle) => handle.try_send(frame),
                None => return false,
            }
        };

        match outcome {
            SendOutcome::Delivered => true,
            SendOutcome::Dropped => {
                debug!(user = %user, connection = %token, "Dropping frame for slow connection");
                false
            }
            SendOutcome::Closed => {
                self.prune(user, std::slice::from_ref(token)).await;
                false
            }
        }
    }

    async fn prune(&self, user: UserId, tokens: &[ConnectionToken]) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&user) else {
            return;
        };
        for token in tokens {
            entry.connections.remove(token);
            debug!(user = %user, connection = %token, "Removed closed connection");
        }
        if entry.connections.is_empty() {
            entries.remove(&user);
            info!(user = %user, online = entries.len(), "User offline");
        }
    }
}
