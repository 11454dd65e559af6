//! Connection hub
//!
//! The hub owns the registry of local clients. Registration, identification,
//! removal and delivery all arrive as [`HubEvent`]s on one channel and are
//! handled strictly in arrival order by [`Hub::run`], so a delivery can never
//! interleave with the removal of the client it targets.
//!
//! Events produced on this ingest enter through [`HubHandle::publish`] or
//! [`HubHandle::send_to`], which deliver locally and hand the same bytes to
//! the replicator. Events from peer ingests enter through
//! [`HubHandle::deliver_remote`]. Both paths go through [`fanout`], so local
//! and peer events are routed by the same rules.

use crate::client_manager::ClientManager;
use crate::replication::Replicator;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::packets::{JoinPacket, LeavePacket};
use shared::{Character, Packet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Where an event should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Every authenticated client
    All,
    /// Clients whose character is in the room
    Room(String),
    /// The client speaking for one character
    Character(String),
}

impl Route {
    pub fn room(id: impl Into<String>) -> Self {
        Route::Room(id.into())
    }

    pub fn character(id: impl Into<String>) -> Self {
        Route::Character(id.into())
    }

    /// Parses the textual form: `*`, `character:<id>`, or a room id.
    pub fn parse(text: &str) -> Self {
        if text == "*" {
            Route::All
        } else if let Some(id) = text.strip_prefix("character:") {
            Route::Character(id.to_string())
        } else {
            Route::Room(text.to_string())
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::All => write!(f, "*"),
            Route::Room(room) => write!(f, "{room}"),
            Route::Character(id) => write!(f, "character:{id}"),
        }
    }
}

/// Resolves a broadcast event to the routes it is delivered on.
///
/// Teleports are not delivered as-is: they become a `leave` for the room
/// being left and a `join` for the destination. Event types without a
/// broadcast audience yield nothing.
pub fn fanout(payload: &[u8]) -> Result<Vec<(Route, Vec<u8>)>, serde_json::Error> {
    let packet = Packet::decode(payload)?;

    let routes = match packet {
        Packet::Message(p) => {
            let mut routes = vec![(Route::character(p.to.as_str()), payload.to_vec())];
            if p.to != p.from {
                routes.push((Route::character(p.from), payload.to_vec()));
            }
            routes
        }
        Packet::Chat(p) => vec![(Route::room(p.room), payload.to_vec())],
        Packet::Move(p) => vec![(Route::room(p.room), payload.to_vec())],
        Packet::Leave(p) => vec![(Route::room(p.room), payload.to_vec())],
        Packet::ElementAdd(p) | Packet::ElementUpdate(p) => {
            vec![(Route::room(p.room), payload.to_vec())]
        }
        Packet::ElementDelete(p) => vec![(Route::room(p.room), payload.to_vec())],
        Packet::HallwayAdd(p) | Packet::HallwayUpdate(p) => {
            vec![(Route::room(p.room), payload.to_vec())]
        }
        Packet::HallwayDelete(p) => vec![(Route::room(p.room), payload.to_vec())],
        Packet::Join(p) => match p.character {
            Some(character) => vec![(Route::room(character.room), payload.to_vec())],
            None => Vec::new(),
        },
        Packet::Song(_) | Packet::SongEnded(_) => vec![(Route::All, payload.to_vec())],
        Packet::Teleport(p) | Packet::TeleportHome(p) => {
            let Some(character) = p.character else {
                return Ok(Vec::new());
            };

            let leave = Packet::Leave(LeavePacket {
                character: character.clone(),
                room: p.from.clone(),
            });
            let join = Packet::Join(JoinPacket::announce(character));

            vec![
                (Route::room(p.from), leave.encode()?),
                (Route::room(p.to), join.encode()?),
            ]
        }
        _ => Vec::new(),
    };

    Ok(routes)
}

/// Runs when an authenticated client leaves this ingest.
#[async_trait]
pub trait Departure: Send + Sync {
    async fn depart(&self, character: Character);
}

#[derive(Debug)]
pub enum HubEvent {
    Register {
        client_id: u64,
        sender: mpsc::UnboundedSender<Vec<u8>>,
        accepted: oneshot::Sender<bool>,
    },
    Unregister {
        client_id: u64,
    },
    Identify {
        client_id: u64,
        character: Character,
    },
    /// Deliver according to [`fanout`]
    Fanout {
        payload: Vec<u8>,
    },
    /// Deliver to one explicit route
    Direct {
        route: Route,
        payload: Vec<u8>,
    },
    Shutdown,
}

/// Cloneable entry point to the hub.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
    replicator: Option<Arc<Replicator>>,
}

impl HubHandle {
    /// Creates a handle and the receiving end the [`Hub`] is built from.
    /// Without a replicator, events stay on this ingest.
    pub fn new(replicator: Option<Arc<Replicator>>) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, replicator }, rx)
    }

    fn send(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            warn!("Hub is not running; event dropped");
        }
    }

    /// Admits a client. Returns false if the ingest is full or stopping.
    pub async fn register(&self, client_id: u64, sender: mpsc::UnboundedSender<Vec<u8>>) -> bool {
        let (accepted, response) = oneshot::channel();
        self.send(HubEvent::Register {
            client_id,
            sender,
            accepted,
        });
        response.await.unwrap_or(false)
    }

    pub fn unregister(&self, client_id: u64) {
        self.send(HubEvent::Unregister { client_id });
    }

    pub fn identify(&self, client_id: u64, character: Character) {
        self.send(HubEvent::Identify {
            client_id,
            character,
        });
    }

    /// Broadcasts an event produced on this ingest.
    pub async fn publish(&self, packet: &Packet) -> Result<(), serde_json::Error> {
        let payload = packet.encode()?;
        if let Some(replicator) = &self.replicator {
            replicator.publish(None, &payload).await;
        }
        self.send(HubEvent::Fanout { payload });
        Ok(())
    }

    /// Sends an event to one route on every ingest.
    pub async fn send_to(&self, route: Route, packet: &Packet) -> Result<(), serde_json::Error> {
        let payload = packet.encode()?;
        if let Some(replicator) = &self.replicator {
            replicator.publish(Some(&route), &payload).await;
        }
        self.send(HubEvent::Direct { route, payload });
        Ok(())
    }

    /// Delivers an event received from a peer ingest to local clients only.
    pub fn deliver_remote(&self, route: Option<Route>, payload: Vec<u8>) {
        match route {
            Some(route) => self.send(HubEvent::Direct { route, payload }),
            None => self.send(HubEvent::Fanout { payload }),
        }
    }

    pub fn shutdown(&self) {
        self.send(HubEvent::Shutdown);
    }
}

/// The hub's event loop and the registry it owns.
pub struct Hub {
    clients: ClientManager,
    events: mpsc::UnboundedReceiver<HubEvent>,
    departure: Arc<dyn Departure>,
}

impl Hub {
    pub fn new(
        max_clients: usize,
        events: mpsc::UnboundedReceiver<HubEvent>,
        departure: Arc<dyn Departure>,
    ) -> Self {
        Self {
            clients: ClientManager::new(max_clients),
            events,
            departure,
        }
    }

    /// Processes events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(event) = self.events.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        info!("Hub stopped with {} clients connected", self.clients.len());
    }

    fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Register {
                client_id,
                sender,
                accepted,
            } => {
                let admitted = self.clients.add_client(client_id, sender);
                // The connection may have closed while waiting
                let _ = accepted.send(admitted);
            }
            HubEvent::Unregister { client_id } => {
                if let Some(client) = self.clients.remove_client(client_id) {
                    if let Some(character) = client.character {
                        let departure = Arc::clone(&self.departure);
                        tokio::spawn(async move {
                            departure.depart(character).await;
                        });
                    }
                }
            }
            HubEvent::Identify {
                client_id,
                character,
            } => {
                if !self.clients.identify(client_id, character) {
                    debug!("Identify for unknown client {}", client_id);
                }
            }
            HubEvent::Fanout { payload } => match fanout(&payload) {
                Ok(routes) => {
                    for (route, bytes) in routes {
                        let delivered = self.clients.deliver(&route, &bytes);
                        debug!("Delivered to {} local clients on {}", delivered, route);
                    }
                }
                Err(e) => error!("Undeliverable event: {}", e),
            },
            HubEvent::Direct { route, payload } => {
                self.clients.deliver(&route, &payload);
            }
            HubEvent::Shutdown => return false,
        }
        true
    }
}
