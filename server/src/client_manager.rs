//! Registry of the clients connected to this ingest
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Admission against the configured capacity
//! - The character each connection has authenticated as, if any
//! - Matching clients against a fan-out route and queueing bytes to them
//!
//! The registry is owned by the hub's event loop and is never shared, so it
//! needs no locking.

use crate::hub::Route;
use log::{debug, info};
use shared::Character;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// A live connection and the character it speaks for
#[derive(Debug)]
pub struct ConnectedClient {
    /// Connection id assigned by the network layer
    pub id: u64,
    /// Outbound queue drained by the connection's writer task
    pub sender: UnboundedSender<Vec<u8>>,
    /// Set once the connection has authenticated
    pub character: Option<Character>,
}

impl ConnectedClient {
    pub fn new(id: u64, sender: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            sender,
            character: None,
        }
    }

    /// Whether this client should receive an event sent to `route`.
    ///
    /// Clients that have not authenticated never match.
    pub fn matches(&self, route: &Route) -> bool {
        let Some(character) = &self.character else {
            return false;
        };

        match route {
            Route::All => true,
            Route::Room(room) => character.room == *room,
            Route::Character(id) => character.id == *id,
        }
    }
}

/// Manages all clients connected to this ingest
///
/// Enforces the capacity limit and resolves fan-out routes to the outbound
/// queues of matching clients.
pub struct ClientManager {
    clients: HashMap<u64, ConnectedClient>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Admits a client, replacing any previous entry with the same id.
    ///
    /// Returns false when the registry is full.
    pub fn add_client(&mut self, id: u64, sender: UnboundedSender<Vec<u8>>) -> bool {
        if !self.clients.contains_key(&id) && self.is_full() {
            info!("Rejecting client {}: server full", id);
            return false;
        }

        self.clients.insert(id, ConnectedClient::new(id, sender));
        info!("Client {} connected ({} online)", id, self.clients.len());
        true
    }

    /// Removes a client, dropping its outbound queue.
    pub fn remove_client(&mut self, id: u64) -> Option<ConnectedClient> {
        let client = self.clients.remove(&id)?;
        info!("Client {} disconnected ({} online)", id, self.clients.len());
        Some(client)
    }

    /// Records (or refreshes) the character a client speaks for.
    pub fn identify(&mut self, id: u64, character: Character) -> bool {
        match self.clients.get_mut(&id) {
            Some(client) => {
                client.character = Some(character);
                true
            }
            None => false,
        }
    }

    /// Queues `payload` to every client matching `route` and returns how many
    /// clients it was queued to.
    pub fn deliver(&self, route: &Route, payload: &[u8]) -> usize {
        let mut delivered = 0;

        for client in self.clients.values().filter(|c| c.matches(route)) {
            if client.sender.send(payload.to_vec()).is_ok() {
                delivered += 1;
            } else {
                // Writer already gone; its unregister is on the way
                debug!("Dropping event for closing client {}", client.id);
            }
        }

        delivered
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }
}
