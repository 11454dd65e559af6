use super::{Dispatcher, Session};
use crate::db;
use crate::error::DispatchError;
use crate::store::StoreOp;
use crate::utils::new_id;
use log::{debug, info};
use shared::packets::{
    ChatPacket, ElementDeletePacket, ElementPacket, ElementTogglePacket, HallwayDeletePacket,
    HallwayPacket, InitPacket, MapPacket, MovePacket, SongPacket, TeleportPacket,
    UpdateMapPacket,
};
use shared::{
    clamp_coordinate, is_ascii_text, Element, ElementAction, Packet, Room, Song, StoreRecord,
};

const ANIMATED_TILE: &str = "tiles/blue1.svg";
const TILE_FRAMES: &[&str] = &[
    "tiles/blue1.svg",
    "tiles/blue2.svg",
    "tiles/blue3.svg",
    "tiles/blue4.svg",
    "tiles/green1.svg",
    "tiles/green2.svg",
    "tiles/pink1.svg",
    "tiles/pink2.svg",
    "tiles/pink3.svg",
    "tiles/pink4.svg",
    "tiles/yellow1.svg",
];
const TILE_INTERVAL_MS: u64 = 2000;
const JUKEBOX: &str = "djbooth.svg";

/// Fills in behavior implied by an element's image.
fn apply_asset_rules(element: &mut Element) {
    if element.path == ANIMATED_TILE {
        element.changing_image_path = true;
        element.changing_paths = TILE_FRAMES.join(",");
        element.changing_interval = TILE_INTERVAL_MS;
    }
    if element.path == JUKEBOX {
        element.action = ElementAction::OpenJukebox;
    }
}

impl Dispatcher {
    pub(super) async fn move_character(
        &self,
        session: &mut Session,
        packet: MovePacket,
    ) -> Result<(), DispatchError> {
        let character = session.authenticated()?;
        let id = character.id.clone();
        let room = character.room.clone();

        self.store()
            .exec(vec![StoreOp::hset(
                db::character(&id),
                vec![
                    ("x".to_string(), packet.x.to_string()),
                    ("y".to_string(), packet.y.to_string()),
                ],
            )])
            .await?;

        if let Some(character) = session.character.as_mut() {
            character.x = packet.x;
            character.y = packet.y;
        }

        self.hub
            .publish(&Packet::Move(MovePacket {
                id,
                room,
                x: packet.x,
                y: packet.y,
            }))
            .await?;
        Ok(())
    }

    /// Handles `teleport` and `teleport_home`. The mover gets the new room's
    /// init; both rooms see the move as a leave and a join.
    pub(super) async fn teleport(
        &self,
        session: &mut Session,
        packet: TeleportPacket,
        home: bool,
    ) -> Result<(), DispatchError> {
        let mut character = session.authenticated()?.clone();
        let x = clamp_coordinate(packet.x);
        let y = clamp_coordinate(packet.y);

        let destination = if home {
            match &character.sponsor_id {
                Some(sponsor_id) => Room::sponsor(sponsor_id),
                None => Room::home(&character.id),
            }
        } else if packet.to.is_empty() {
            return Err(DispatchError::Rejected("missing destination"));
        } else {
            Room::new(packet.to.clone(), self.world.default_background.clone(), false)
        };
        db::ensure_room(self.store(), &destination).await?;

        let from = character.room.clone();
        let to = destination.id;

        self.store()
            .exec(vec![
                StoreOp::hset(
                    db::character(&character.id),
                    vec![
                        ("room".to_string(), to.clone()),
                        ("x".to_string(), x.to_string()),
                        ("y".to_string(), y.to_string()),
                    ],
                ),
                StoreOp::srem(db::room_characters(&from), character.id.clone()),
                StoreOp::sadd(db::room_characters(&to), character.id.clone()),
            ])
            .await?;

        debug!("Character {} moved from {} to {}", character.id, from, to);
        character.room = to.clone();
        character.x = x;
        character.y = y;
        session.character = Some(character.clone());
        self.hub.identify(session.client_id, character.clone());

        let room = db::load_room(self.store(), &to).await?;
        session.reply(&Packet::Init(InitPacket {
            character_id: character.id.clone(),
            room,
            first_time: false,
        }))?;

        let moved = TeleportPacket {
            from,
            to,
            x,
            y,
            character: Some(character),
        };
        let event = if home {
            Packet::TeleportHome(moved)
        } else {
            Packet::Teleport(moved)
        };
        self.hub.publish(&event).await?;
        Ok(())
    }

    pub(super) async fn chat(
        &self,
        session: &mut Session,
        packet: ChatPacket,
    ) -> Result<(), DispatchError> {
        if !is_ascii_text(&packet.message) {
            return Err(DispatchError::Rejected("chat must be ascii"));
        }

        let character = session.authenticated()?;
        self.hub
            .publish(&Packet::Chat(ChatPacket {
                id: character.id.clone(),
                room: character.room.clone(),
                message: packet.message,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn toggle_element(
        &self,
        session: &mut Session,
        packet: ElementTogglePacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        let mut element: Element = db::load(self.store(), &db::element(&packet.id), &packet.id)
            .await?
            .ok_or(DispatchError::Rejected("unknown element"))?;

        element.toggle();
        self.store()
            .exec(vec![StoreOp::hset_one(
                db::element(&element.id),
                "state",
                element.state.to_string(),
            )])
            .await?;

        self.hub
            .publish(&Packet::ElementUpdate(ElementPacket {
                id: element.id.clone(),
                room,
                element,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn add_element(
        &self,
        session: &mut Session,
        packet: ElementPacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        let mut element = packet.element;
        element.id = new_id();
        apply_asset_rules(&mut element);

        self.store()
            .exec(vec![
                StoreOp::hset(db::element(&element.id), element.to_fields()),
                StoreOp::rpush(db::room_elements(&room), element.id.clone()),
            ])
            .await?;

        self.hub
            .publish(&Packet::ElementAdd(ElementPacket {
                id: element.id.clone(),
                room,
                element,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn update_element(
        &self,
        session: &mut Session,
        packet: ElementPacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        if packet.id.is_empty() {
            return Err(DispatchError::Rejected("missing element id"));
        }

        let mut element = packet.element;
        element.id = packet.id;
        apply_asset_rules(&mut element);

        self.store()
            .exec(vec![StoreOp::hset(
                db::element(&element.id),
                element.to_fields(),
            )])
            .await?;

        self.hub
            .publish(&Packet::ElementUpdate(ElementPacket {
                id: element.id.clone(),
                room,
                element,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn delete_element(
        &self,
        session: &mut Session,
        packet: ElementDeletePacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        self.store()
            .exec(vec![
                StoreOp::del(db::element(&packet.id)),
                StoreOp::lrem(db::room_elements(&room), packet.id.clone()),
            ])
            .await?;

        self.hub
            .publish(&Packet::ElementDelete(ElementDeletePacket {
                id: packet.id,
                room,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn add_hallway(
        &self,
        session: &mut Session,
        packet: HallwayPacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        let mut hallway = packet.hallway;
        hallway.id = new_id();

        self.store()
            .exec(vec![
                StoreOp::hset(db::hallway(&hallway.id), hallway.to_fields()),
                StoreOp::sadd(db::room_hallways(&room), hallway.id.clone()),
            ])
            .await?;

        self.hub
            .publish(&Packet::HallwayAdd(HallwayPacket {
                id: hallway.id.clone(),
                room,
                hallway,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn update_hallway(
        &self,
        session: &mut Session,
        packet: HallwayPacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        if packet.id.is_empty() {
            return Err(DispatchError::Rejected("missing hallway id"));
        }

        let mut hallway = packet.hallway;
        hallway.id = packet.id;
        self.store()
            .exec(vec![StoreOp::hset(
                db::hallway(&hallway.id),
                hallway.to_fields(),
            )])
            .await?;

        self.hub
            .publish(&Packet::HallwayUpdate(HallwayPacket {
                id: hallway.id.clone(),
                room,
                hallway,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn delete_hallway(
        &self,
        session: &mut Session,
        packet: HallwayDeletePacket,
    ) -> Result<(), DispatchError> {
        let room = session.authenticated()?.room.clone();
        self.store()
            .exec(vec![
                StoreOp::del(db::hallway(&packet.id)),
                StoreOp::srem(db::room_hallways(&room), packet.id.clone()),
            ])
            .await?;

        self.hub
            .publish(&Packet::HallwayDelete(HallwayDeletePacket {
                id: packet.id,
                room,
            }))
            .await?;
        Ok(())
    }

    /// Looks the video up and appends it to the jukebox queue.
    pub(super) async fn queue_song(
        &self,
        session: &mut Session,
        packet: SongPacket,
    ) -> Result<(), DispatchError> {
        let character_id = session.authenticated()?.id.clone();
        let vid_code = packet.song.vid_code;
        if vid_code.is_empty() {
            return Err(DispatchError::Rejected("missing video code"));
        }

        let details = self.services.videos.lookup(&vid_code).await?;
        let song = Song {
            id: new_id(),
            vid_code,
            title: details.title,
            duration: details.duration,
            thumbnail_url: details.thumbnail_url,
            character_id,
        };

        self.store()
            .exec(vec![
                StoreOp::hset(db::song(&song.id), song.to_fields()),
                StoreOp::rpush(db::SONGS, song.id.clone()),
            ])
            .await?;

        info!("Queued song {} ({})", song.title, song.id);
        self.hub.publish(&Packet::Song(SongPacket { song })).await?;
        Ok(())
    }

    pub(super) async fn get_map(&self, session: &mut Session) -> Result<(), DispatchError> {
        let locations = db::load_locations(self.store()).await?;
        session.reply(&Packet::Map(MapPacket { locations }))
    }

    /// Pins the sender on the world map, then replies with the whole map.
    pub(super) async fn update_map(
        &self,
        session: &mut Session,
        packet: UpdateMapPacket,
    ) -> Result<(), DispatchError> {
        let mut location = packet.location;
        location.id = session.authenticated()?.id.clone();

        self.store()
            .exec(vec![
                StoreOp::hset(db::location(&location.id), location.to_fields()),
                StoreOp::sadd(db::LOCATIONS, location.id.clone()),
            ])
            .await?;

        self.get_map(session).await
    }
}
