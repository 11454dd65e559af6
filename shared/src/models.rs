//! World entities shared by the server and its clients.
//!
//! Every entity has two representations: the camelCase JSON carried inside
//! packets, and the flat string hash kept in the shared store. The second is
//! produced by [`StoreRecord`]. Collections hanging off a [`Room`] are never
//! stored inside the room hash; the server assembles them from related keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Conversion between an entity and its store hash.
pub trait StoreRecord: Sized {
    /// Fields written with `HSET`. The id is part of the key, not the hash.
    fn to_fields(&self) -> Vec<(String, String)>;

    /// Rebuilds the entity from `HGETALL` output. Returns `None` for an
    /// empty hash, which is how the store reports a missing key.
    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self>;
}

fn text(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn optional(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn number<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn flag(fields: &HashMap<String, String>, name: &str) -> bool {
    matches!(fields.get(name).map(String::as_str), Some("1") | Some("true"))
}

/// Privilege level of a character, ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Role {
    #[default]
    Guest,
    Hacker,
    SponsorRep,
    Mentor,
    Organizer,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        match value {
            1 => Role::Hacker,
            2 => Role::SponsorRep,
            3 => Role::Mentor,
            4 => Role::Organizer,
            _ => Role::Guest,
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        match role {
            Role::Guest => 0,
            Role::Hacker => 1,
            Role::SponsorRep => 2,
            Role::Mentor => 3,
            Role::Organizer => 4,
        }
    }
}

/// A player's avatar. Owned by the store; servers only cache it for the
/// lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub room: String,
    pub x: f64,
    pub y: f64,
    pub ingest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
}

impl Character {
    /// Creates a guest standing in the middle of `room`.
    pub fn new(id: impl Into<String>, name: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: Role::Guest,
            room: room.into(),
            x: 0.5,
            y: 0.5,
            ..Self::default()
        }
    }
}

impl StoreRecord for Character {
    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("name".to_string(), self.name.clone()),
            ("role".to_string(), u8::from(self.role).to_string()),
            ("room".to_string(), self.room.clone()),
            ("x".to_string(), self.x.to_string()),
            ("y".to_string(), self.y.to_string()),
            ("ingest".to_string(), self.ingest.clone()),
        ];
        if let Some(sponsor_id) = &self.sponsor_id {
            fields.push(("sponsorId".to_string(), sponsor_id.clone()));
        }
        if let Some(queue_id) = &self.queue_id {
            fields.push(("queueId".to_string(), queue_id.clone()));
        }
        fields
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            name: text(fields, "name"),
            role: Role::from(number::<u8>(fields, "role")),
            room: text(fields, "room"),
            x: number(fields, "x"),
            y: number(fields, "y"),
            ingest: text(fields, "ingest"),
            sponsor_id: optional(fields, "sponsorId"),
            queue_id: optional(fields, "queueId"),
        })
    }
}

/// A room and the live views assembled around it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Room {
    pub id: String,
    pub background: String,
    pub sponsor: bool,
    pub characters: HashMap<String, Character>,
    pub elements: Vec<Element>,
    pub hallways: HashMap<String, Hallway>,
}

impl Room {
    pub fn new(id: impl Into<String>, background: impl Into<String>, sponsor: bool) -> Self {
        Self {
            id: id.into(),
            background: background.into(),
            sponsor,
            ..Self::default()
        }
    }

    /// The personal room every character gets on demand.
    pub fn home(character_id: &str) -> Self {
        Self::new(format!("home:{character_id}"), "home.png", false)
    }

    pub fn sponsor(sponsor_id: &str) -> Self {
        Self::new(format!("sponsor:{sponsor_id}"), "sponsor.png", true)
    }
}

impl StoreRecord for Room {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.clone()),
            ("background".to_string(), self.background.clone()),
            ("sponsor".to_string(), self.sponsor.to_string()),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self::new(id, text(fields, "background"), flag(fields, "sponsor")))
    }
}

/// What happens when a character interacts with an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ElementAction {
    #[default]
    None,
    OpenJukebox,
}

impl From<u8> for ElementAction {
    fn from(value: u8) -> Self {
        match value {
            1 => ElementAction::OpenJukebox,
            _ => ElementAction::None,
        }
    }
}

impl From<ElementAction> for u8 {
    fn from(action: ElementAction) -> Self {
        match action {
            ElementAction::None => 0,
            ElementAction::OpenJukebox => 1,
        }
    }
}

/// A placeable object. `path` lists the image of every state, comma
/// separated, and `state` indexes into it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Element {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub path: String,
    pub state: usize,
    pub action: ElementAction,
    pub changing_image_path: bool,
    pub changing_paths: String,
    pub changing_interval: u64,
}

impl Element {
    pub fn state_count(&self) -> usize {
        self.path.matches(',').count() + 1
    }

    /// Advances to the next state, wrapping after the last one.
    pub fn toggle(&mut self) {
        self.state = next_state(self.state, self.state_count());
    }
}

/// Successor of `state` in a cycle of `count` states. A stored state past
/// the end is folded back into the cycle first.
pub fn next_state(state: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    (state % count + 1) % count
}

impl StoreRecord for Element {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("x".to_string(), self.x.to_string()),
            ("y".to_string(), self.y.to_string()),
            ("width".to_string(), self.width.to_string()),
            ("path".to_string(), self.path.clone()),
            ("state".to_string(), self.state.to_string()),
            ("action".to_string(), u8::from(self.action).to_string()),
            (
                "changingImagePath".to_string(),
                self.changing_image_path.to_string(),
            ),
            ("changingPaths".to_string(), self.changing_paths.clone()),
            (
                "changingInterval".to_string(),
                self.changing_interval.to_string(),
            ),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            x: number(fields, "x"),
            y: number(fields, "y"),
            width: number(fields, "width"),
            path: text(fields, "path"),
            state: number(fields, "state"),
            action: ElementAction::from(number::<u8>(fields, "action")),
            changing_image_path: flag(fields, "changingImagePath"),
            changing_paths: text(fields, "changingPaths"),
            changing_interval: number(fields, "changingInterval"),
        })
    }
}

/// A portal from one room into another.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hallway {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub to: String,
}

impl StoreRecord for Hallway {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("x".to_string(), self.x.to_string()),
            ("y".to_string(), self.y.to_string()),
            ("radius".to_string(), self.radius.to_string()),
            ("to".to_string(), self.to.clone()),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            x: number(fields, "x"),
            y: number(fields, "y"),
            radius: number(fields, "radius"),
            to: text(fields, "to"),
        })
    }
}

/// One direct message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: u64,
}

impl StoreRecord for Message {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("from".to_string(), self.from.clone()),
            ("to".to_string(), self.to.clone()),
            ("text".to_string(), self.text.clone()),
            ("timestamp".to_string(), self.timestamp.to_string()),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            from: text(fields, "from"),
            to: text(fields, "to"),
            text: text(fields, "text"),
            timestamp: number(fields, "timestamp"),
        })
    }
}

/// A hacker waiting in a sponsor's queue, as the sponsor sees them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSubscriber {
    pub id: String,
    pub name: String,
}

impl From<&Character> for QueueSubscriber {
    fn from(character: &Character) -> Self {
        Self {
            id: character.id.clone(),
            name: character.name.clone(),
        }
    }
}

impl StoreRecord for QueueSubscriber {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![("name".to_string(), self.name.clone())]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            name: text(fields, "name"),
        })
    }
}

/// A pin on the world map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

impl StoreRecord for Location {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("name".to_string(), self.name.clone()),
            ("lat".to_string(), self.lat.to_string()),
            ("lng".to_string(), self.lng.to_string()),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            name: text(fields, "name"),
            lat: number(fields, "lat"),
            lng: number(fields, "lng"),
        })
    }
}

/// A jukebox entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Song {
    pub id: String,
    pub vid_code: String,
    pub title: String,
    /// Length in seconds.
    pub duration: u64,
    pub thumbnail_url: String,
    pub character_id: String,
}

impl StoreRecord for Song {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("vidCode".to_string(), self.vid_code.clone()),
            ("title".to_string(), self.title.clone()),
            ("duration".to_string(), self.duration.to_string()),
            ("thumbnailUrl".to_string(), self.thumbnail_url.clone()),
            ("characterId".to_string(), self.character_id.clone()),
        ]
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            vid_code: text(fields, "vidCode"),
            title: text(fields, "title"),
            duration: number(fields, "duration"),
            thumbnail_url: text(fields, "thumbnailUrl"),
            character_id: text(fields, "characterId"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_character_store_fields() {
        let mut character = Character::new("c1", "Alice", "lobby");
        character.role = Role::SponsorRep;
        character.sponsor_id = Some("acme".to_string());

        let fields = as_map(character.to_fields());
        assert_eq!(fields.get("role").map(String::as_str), Some("2"));
        assert_eq!(fields.get("sponsorId").map(String::as_str), Some("acme"));
        assert!(!fields.contains_key("queueId"));

        let restored = Character::from_fields("c1", &fields).unwrap();
        assert_eq!(restored, character);
    }

    #[test]
    fn test_missing_hash_is_none() {
        assert!(Character::from_fields("ghost", &HashMap::new()).is_none());
        assert!(Element::from_fields("ghost", &HashMap::new()).is_none());
    }

    #[test]
    fn test_role_wire_format() {
        let json = serde_json::to_string(&Role::Organizer).unwrap();
        assert_eq!(json, "4");
        let role: Role = serde_json::from_str("9").unwrap();
        assert_eq!(role, Role::Guest);
    }

    #[test]
    fn test_character_json_is_camel_case() {
        let mut character = Character::new("c1", "Alice", "lobby");
        character.sponsor_id = Some("acme".to_string());
        let json = serde_json::to_value(&character).unwrap();
        assert_eq!(json["sponsorId"], "acme");
        assert!(json.get("queueId").is_none());
    }

    #[test]
    fn test_element_toggle_wraps() {
        let mut element = Element {
            path: "lamp_off.svg,lamp_on.svg,lamp_broken.svg".to_string(),
            ..Element::default()
        };
        assert_eq!(element.state_count(), 3);

        element.toggle();
        assert_eq!(element.state, 1);
        element.toggle();
        assert_eq!(element.state, 2);
        element.toggle();
        assert_eq!(element.state, 0);
    }

    #[test]
    fn test_element_toggle_out_of_range_state() {
        let mut element = Element {
            path: "a.svg,b.svg".to_string(),
            state: usize::MAX,
            ..Element::default()
        };
        element.toggle();
        assert!(element.state < element.state_count());

        element.state = 5;
        element.toggle();
        assert_eq!(element.state, 0);
    }

    #[test]
    fn test_element_toggle_full_cycle_is_identity() {
        for count in 1..6 {
            let path = vec!["s.svg"; count].join(",");
            for start in 0..count {
                let mut element = Element {
                    path: path.clone(),
                    state: start,
                    ..Element::default()
                };
                for _ in 0..element.state_count() {
                    element.toggle();
                }
                assert_eq!(element.state, start);
            }
        }
    }

    #[test]
    fn test_single_state_element_stays_put() {
        let mut element = Element {
            path: "plant.svg".to_string(),
            ..Element::default()
        };
        element.toggle();
        assert_eq!(element.state, 0);
    }

    #[test]
    fn test_room_scalar_fields_only() {
        let mut room = Room::home("c1");
        room.characters
            .insert("c1".to_string(), Character::new("c1", "Alice", "home:c1"));

        let fields = as_map(room.to_fields());
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.get("background").map(String::as_str), Some("home.png"));

        let restored = Room::from_fields("home:c1", &fields).unwrap();
        assert!(restored.characters.is_empty());
        assert!(!restored.sponsor);
    }

    #[test]
    fn test_sponsor_room() {
        let room = Room::sponsor("acme");
        assert_eq!(room.id, "sponsor:acme");
        assert!(room.sponsor);
    }

    #[test]
    fn test_element_action_fields() {
        let element = Element {
            id: "e1".to_string(),
            path: "djbooth.svg".to_string(),
            action: ElementAction::OpenJukebox,
            ..Element::default()
        };
        let fields = as_map(element.to_fields());
        assert_eq!(fields.get("action").map(String::as_str), Some("1"));
        assert_eq!(Element::from_fields("e1", &fields).unwrap(), element);
    }
}
