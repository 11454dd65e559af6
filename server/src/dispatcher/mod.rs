//! Packet dispatcher
//!
//! Applies one inbound packet end to end: decode, permission check, effect
//! against the store, then delivery of whatever the effect produced. Every
//! failure stops at [`Dispatcher::dispatch`]; the connection stays open and
//! nothing reaches the hub loop.
//!
//! Handlers are grouped by concern:
//! - `join`: authentication, presence, profile and disconnect cleanup
//! - `email`: one-time login codes and the email allow-lists
//! - `world`: movement, rooms, elements, hallways, jukebox and map
//! - `social`: direct messages, friends, events and achievements
//! - `queue`: sponsor queues

mod email;
mod join;
mod queue;
mod social;
mod world;

use crate::config::{AchievementSettings, Settings, WorldSettings};
use crate::error::DispatchError;
use crate::hub::{Departure, HubHandle};
use crate::services::Services;
use crate::store::Store;
use async_trait::async_trait;
use log::{debug, error, warn};
use shared::packets::ErrorPacket;
use shared::{Character, Packet, Role};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-connection state owned by the connection's reader task.
pub struct Session {
    pub client_id: u64,
    /// Set once the connection has authenticated
    pub character: Option<Character>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Session {
    pub fn new(client_id: u64, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            client_id,
            character: None,
            outbound,
        }
    }

    /// Sends a packet to this connection only.
    pub fn reply(&self, packet: &Packet) -> Result<(), DispatchError> {
        let payload = packet.encode()?;
        if self.outbound.send(payload).is_err() {
            debug!("Client {} closed before reply", self.client_id);
        }
        Ok(())
    }

    fn authenticated(&self) -> Result<&Character, DispatchError> {
        self.character
            .as_ref()
            .ok_or(DispatchError::Rejected("not authenticated"))
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    hub: HubHandle,
    services: Services,
    world: WorldSettings,
    achievements: AchievementSettings,
    ingest_id: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        hub: HubHandle,
        services: Services,
        settings: &Settings,
        ingest_id: i64,
    ) -> Self {
        Self {
            store,
            hub,
            services,
            world: settings.world.clone(),
            achievements: settings.achievements.clone(),
            ingest_id: ingest_id.to_string(),
        }
    }

    fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Applies one raw message from `session`.
    pub async fn dispatch(&self, session: &mut Session, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    "Invalid packet from client {}: {} ({})",
                    session.client_id,
                    String::from_utf8_lossy(data),
                    e
                );
                return;
            }
        };

        let (character_id, role) = match &session.character {
            Some(character) => (character.id.as_str(), character.role),
            None => ("", Role::Guest),
        };

        if !packet.allowed(character_id, role) {
            debug!(
                "Client {} is not allowed to send {}",
                session.client_id,
                packet.kind()
            );
            return;
        }

        let kind = packet.kind();
        match self.apply(session, packet).await {
            Ok(()) => {}
            Err(DispatchError::Auth(failure)) => {
                debug!("Client {} failed {}: {}", session.client_id, kind, failure);
                let response = Packet::Error(ErrorPacket {
                    code: failure.code(),
                });
                if let Err(e) = session.reply(&response) {
                    error!("Failed to send error to client {}: {}", session.client_id, e);
                }
            }
            Err(DispatchError::Rejected(reason)) => {
                debug!(
                    "Dropped {} packet from client {}: {}",
                    kind, session.client_id, reason
                );
            }
            Err(e) => {
                error!(
                    "Failed to apply {} packet from client {}: {}",
                    kind, session.client_id, e
                );
            }
        }
    }

    async fn apply(&self, session: &mut Session, packet: Packet) -> Result<(), DispatchError> {
        match packet {
            Packet::Join(p) => self.join(session, p, true).await,
            Packet::Auth(p) => self.join(session, p, false).await,
            Packet::Status(p) => self.update_status(session, p).await,
            Packet::Settings(p) => self.update_settings(session, p).await,
            Packet::Register(p) => self.register(session, p).await,

            Packet::Move(p) => self.move_character(session, p).await,
            Packet::Teleport(p) => self.teleport(session, p, false).await,
            Packet::TeleportHome(p) => self.teleport(session, p, true).await,

            Packet::Chat(p) => self.chat(session, p).await,
            Packet::ElementToggle(p) => self.toggle_element(session, p).await,
            Packet::ElementAdd(p) => self.add_element(session, p).await,
            Packet::ElementUpdate(p) => self.update_element(session, p).await,
            Packet::ElementDelete(p) => self.delete_element(session, p).await,
            Packet::HallwayAdd(p) => self.add_hallway(session, p).await,
            Packet::HallwayUpdate(p) => self.update_hallway(session, p).await,
            Packet::HallwayDelete(p) => self.delete_hallway(session, p).await,
            Packet::Song(p) => self.queue_song(session, p).await,
            Packet::GetMap(_) => self.get_map(session).await,
            Packet::UpdateMap(p) => self.update_map(session, p).await,

            Packet::Message(p) => self.send_message(session, p).await,
            Packet::GetMessages(p) => self.get_messages(session, p).await,
            Packet::FriendRequest(p) => self.friend_request(session, p).await,
            Packet::Event(p) => self.attend_event(session, p).await,
            Packet::GetAchievements(_) => self.get_achievements(session).await,

            Packet::QueueJoin(p) => self.queue_join(session, p).await,
            Packet::QueueRemove(p) => self.queue_remove(session, p).await,
            Packet::QueueSubscribe(p) => self.queue_subscribe(session, p).await,
            Packet::QueueUnsubscribe(p) => self.queue_unsubscribe(session, p).await,

            Packet::EmailCode(p) => self.email_code(p).await,
            Packet::AddEmail(p) => self.add_email(p).await,

            // Server-produced packets never pass the permission check
            other => Err(DispatchError::Rejected(other.kind())),
        }
    }
}

#[async_trait]
impl Departure for Dispatcher {
    async fn depart(&self, character: Character) {
        if let Err(e) = self.disconnect(&character).await {
            error!("Failed to clean up after character {}: {}", character.id, e);
        }
    }
}
