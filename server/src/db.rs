//! Store key schema and the reads shared by several handlers.
//!
//! Other tooling reads the same keys, so the layout here is a contract.

use crate::store::{Store, StoreError, StoreOp};
use shared::{
    Character, Element, Hallway, Location, Message, QueueSubscriber, Room, Song, StoreRecord,
};
use std::collections::BTreeSet;

pub const ROOMS: &str = "rooms";
pub const EVENTS: &str = "events";
pub const LOGIN_REQUESTS: &str = "login_requests";
pub const SONGS: &str = "songs";
pub const SONGS_STARTED: &str = "songs:started";
pub const LOCATIONS: &str = "locations";
pub const SPONSOR_EMAILS: &str = "sponsor_emails";
pub const MENTOR_EMAILS: &str = "mentor_emails";
pub const ORGANIZER_EMAILS: &str = "organizer_emails";
pub const EMAIL_TO_CHARACTER: &str = "emailToCharacter";
pub const EMAIL_TO_SPONSOR: &str = "emailToSponsor";
pub const QUILL_TO_CHARACTER: &str = "quillToCharacter";

pub fn character(id: &str) -> String {
    format!("character:{id}")
}

pub fn active(character_id: &str) -> String {
    format!("character:{character_id}:active")
}

pub fn teammates(character_id: &str) -> String {
    format!("character:{character_id}:teammates")
}

pub fn friends(character_id: &str) -> String {
    format!("character:{character_id}:friends")
}

pub fn requests(character_id: &str) -> String {
    format!("character:{character_id}:requests")
}

pub fn settings(character_id: &str) -> String {
    format!("character:{character_id}:settings")
}

pub fn achievements(character_id: &str) -> String {
    format!("character:{character_id}:achievements")
}

pub fn attended(character_id: &str) -> String {
    format!("character:{character_id}:events")
}

pub fn attendees(event_id: &str) -> String {
    format!("event:{event_id}:attendees")
}

pub fn room(id: &str) -> String {
    format!("room:{id}")
}

pub fn room_characters(room_id: &str) -> String {
    format!("room:{room_id}:characters")
}

pub fn room_elements(room_id: &str) -> String {
    format!("room:{room_id}:elements")
}

pub fn room_hallways(room_id: &str) -> String {
    format!("room:{room_id}:hallways")
}

pub fn element(id: &str) -> String {
    format!("element:{id}")
}

pub fn hallway(id: &str) -> String {
    format!("hallway:{id}")
}

pub fn message(id: &str) -> String {
    format!("message:{id}")
}

pub fn song(id: &str) -> String {
    format!("song:{id}")
}

pub fn location(id: &str) -> String {
    format!("location:{id}")
}

pub fn sponsor(id: &str) -> String {
    format!("sponsor:{id}")
}

pub fn hacker_queue(sponsor_id: &str) -> String {
    format!("sponsor:{sponsor_id}:hackerqueue")
}

pub fn queue_subscribed(sponsor_id: &str) -> String {
    format!("sponsor:{sponsor_id}:subscribed")
}

pub fn subscriber(character_id: &str) -> String {
    format!("subscriber:{character_id}")
}

pub fn ingest_characters(ingest_id: &str) -> String {
    format!("ingest:{ingest_id}:characters")
}

/// Loads one record stored as a hash under `key`.
pub async fn load<T: StoreRecord>(
    store: &dyn Store,
    key: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    let fields = store.hgetall(key).await?;
    Ok(T::from_fields(id, &fields))
}

pub async fn load_character(
    store: &dyn Store,
    id: &str,
) -> Result<Option<Character>, StoreError> {
    load(store, &character(id), id).await
}

/// Loads every record whose id is listed, skipping ids without a hash.
pub async fn load_all<T: StoreRecord>(
    store: &dyn Store,
    ids: &[String],
    key: fn(&str) -> String,
) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = load(store, &key(id), id).await? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Assembles a room with its live members, elements and hallways.
pub async fn load_room(store: &dyn Store, id: &str) -> Result<Room, StoreError> {
    let mut room: Room = load(store, &room(id), id)
        .await?
        .unwrap_or_else(|| Room::new(id, "", false));

    let member_ids = store.smembers(&room_characters(id)).await?;
    for character in load_all::<Character>(store, &member_ids, character).await? {
        room.characters.insert(character.id.clone(), character);
    }

    let element_ids = store.lrange(&room_elements(id), 0, -1).await?;
    room.elements = load_all::<Element>(store, &element_ids, element).await?;

    let hallway_ids = store.smembers(&room_hallways(id)).await?;
    for hallway in load_all::<Hallway>(store, &hallway_ids, hallway).await? {
        room.hallways.insert(hallway.id.clone(), hallway);
    }

    Ok(room)
}

/// Writes that register a new room.
pub fn create_room(room: &Room) -> Vec<StoreOp> {
    vec![
        StoreOp::hset(self::room(&room.id), room.to_fields()),
        StoreOp::sadd(ROOMS, room.id.clone()),
    ]
}

/// Creates the room unless it is already registered.
pub async fn ensure_room(store: &dyn Store, room: &Room) -> Result<(), StoreError> {
    if !store.sismember(ROOMS, &room.id).await? {
        store.exec(create_room(room)).await?;
    }
    Ok(())
}

/// Characters told about this character's presence: teammates and friends.
pub async fn presence_audience(
    store: &dyn Store,
    character_id: &str,
) -> Result<Vec<String>, StoreError> {
    let mut audience: BTreeSet<String> = store
        .smembers(&teammates(character_id))
        .await?
        .into_iter()
        .collect();
    audience.extend(store.smembers(&friends(character_id)).await?);
    audience.remove(character_id);
    Ok(audience.into_iter().collect())
}

/// The most recent `limit` messages of a conversation, oldest first.
pub async fn load_messages(
    store: &dyn Store,
    conversation: &str,
    limit: isize,
) -> Result<Vec<Message>, StoreError> {
    let ids = store.lrange(conversation, -limit, -1).await?;
    load_all(store, &ids, message).await
}

/// Hackers waiting in a sponsor's queue, in order.
pub async fn load_queue(
    store: &dyn Store,
    sponsor_id: &str,
) -> Result<Vec<QueueSubscriber>, StoreError> {
    let ids = store.lrange(&hacker_queue(sponsor_id), 0, -1).await?;
    let mut subscribers = Vec::with_capacity(ids.len());
    for id in ids {
        let entry = load(store, &subscriber(&id), &id)
            .await?
            .unwrap_or_else(|| QueueSubscriber {
                id: id.clone(),
                name: String::new(),
            });
        subscribers.push(entry);
    }
    Ok(subscribers)
}

pub async fn load_locations(store: &dyn Store) -> Result<Vec<Location>, StoreError> {
    let ids = store.smembers(LOCATIONS).await?;
    load_all(store, &ids, location).await
}

pub async fn load_song(store: &dyn Store, id: &str) -> Result<Option<Song>, StoreError> {
    load(store, &song(id), id).await
}
