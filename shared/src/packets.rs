//! The wire protocol.
//!
//! Every message is a JSON object whose `type` field selects a variant of
//! [`Packet`]. Fields a client must not choose (sender id, current room,
//! resolved character) are defaulted on decode and filled in by the server
//! before the packet is re-broadcast.

use crate::models::{
    Character, Element, Hallway, Location, Message, QueueSubscriber, Role, Room, Song,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Bad or unknown session token.
pub const ERROR_INVALID_TOKEN: u32 = 1;
/// SSO identity could not be exchanged or is not admitted.
pub const ERROR_NOT_ADMITTED: u32 = 2;
/// Email one-time code does not match an issued one.
pub const ERROR_INVALID_CODE: u32 = 3;
/// The ingest has no room for another connection.
pub const ERROR_SERVER_FULL: u32 = 4;

/// Number of messages returned by a history request.
pub const MESSAGE_HISTORY_LIMIT: isize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    // Sessions
    Join(JoinPacket),
    Auth(JoinPacket),
    Init(InitPacket),
    Leave(LeavePacket),
    Error(ErrorPacket),
    Status(StatusPacket),
    Register(RegisterPacket),
    Settings(SettingsPacket),

    // Movement
    Move(MovePacket),
    Teleport(TeleportPacket),
    TeleportHome(TeleportPacket),

    // Room contents
    Chat(ChatPacket),
    ElementToggle(ElementTogglePacket),
    ElementAdd(ElementPacket),
    ElementUpdate(ElementPacket),
    ElementDelete(ElementDeletePacket),
    HallwayAdd(HallwayPacket),
    HallwayUpdate(HallwayPacket),
    HallwayDelete(HallwayDeletePacket),

    // Direct messages and friends
    Message(MessagePacket),
    GetMessages(GetMessagesPacket),
    Messages(MessagesPacket),
    FriendRequest(FriendRequestPacket),
    FriendUpdate(FriendUpdatePacket),

    // Sponsor queues
    QueueJoin(QueuePacket),
    QueueRemove(QueueRemovePacket),
    QueueSubscribe(QueuePacket),
    QueueUnsubscribe(QueuePacket),
    QueueUpdateHacker(QueueUpdateHackerPacket),
    QueueUpdateSponsor(QueueUpdateSponsorPacket),

    // Email login
    EmailCode(EmailCodePacket),
    AddEmail(AddEmailPacket),

    // Events and achievements
    Event(EventPacket),
    GetAchievements(EmptyPacket),
    Achievements(AchievementsPacket),
    AchievementNotification(AchievementNotificationPacket),

    // Jukebox
    Song(SongPacket),
    SongEnded(SongEndedPacket),

    // World map
    GetMap(EmptyPacket),
    UpdateMap(UpdateMapPacket),
    Map(MapPacket),
}

/// Sent by a client to identify itself. Exactly one credential is expected:
/// a display name, an SSO token, a session token, or an email with the code
/// mailed to it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPacket {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub quill_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<Character>,
}

impl JoinPacket {
    /// The broadcast form: credentials stripped, character attached.
    pub fn announce(character: Character) -> Self {
        Self {
            character: Some(character),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitPacket {
    pub character_id: String,
    pub room: Room,
    pub first_time: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeavePacket {
    pub character: Character,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPacket {
    pub code: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusPacket {
    pub id: String,
    pub online: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterPacket {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_subscription: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPacket {
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MovePacket {
    pub id: String,
    pub room: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeleportPacket {
    pub from: String,
    pub to: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<Character>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatPacket {
    pub id: String,
    pub room: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementTogglePacket {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementPacket {
    pub id: String,
    pub room: String,
    pub element: Element,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementDeletePacket {
    pub id: String,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HallwayPacket {
    pub id: String,
    pub room: String,
    pub hallway: Hallway,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HallwayDeletePacket {
    pub id: String,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePacket {
    pub from: String,
    pub to: String,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetMessagesPacket {
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesPacket {
    pub messages: Vec<Message>,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendRequestPacket {
    pub recipient_id: String,
    pub sender_id: String,
}

/// Tells `id` about a change in its relationship with `friend_id`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendUpdatePacket {
    pub id: String,
    pub friend_id: String,
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueuePacket {
    pub sponsor_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueRemovePacket {
    pub sponsor_id: String,
    pub character_id: String,
}

/// A hacker's place in a queue. Position 0 means they were taken off it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueUpdateHackerPacket {
    pub sponsor_id: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueUpdateSponsorPacket {
    pub sponsor_id: String,
    pub subscribers: Vec<QueueSubscriber>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailCodePacket {
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddEmailPacket {
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sponsor_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPacket {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmptyPacket {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AchievementsPacket {
    pub id: String,
    pub achievements: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AchievementNotificationPacket {
    pub achievement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SongPacket {
    pub song: Song,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SongEndedPacket {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateMapPacket {
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapPacket {
    pub locations: Vec<Location>,
}

impl Packet {
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Join(_) => "join",
            Packet::Auth(_) => "auth",
            Packet::Init(_) => "init",
            Packet::Leave(_) => "leave",
            Packet::Error(_) => "error",
            Packet::Status(_) => "status",
            Packet::Register(_) => "register",
            Packet::Settings(_) => "settings",
            Packet::Move(_) => "move",
            Packet::Teleport(_) => "teleport",
            Packet::TeleportHome(_) => "teleport_home",
            Packet::Chat(_) => "chat",
            Packet::ElementToggle(_) => "element_toggle",
            Packet::ElementAdd(_) => "element_add",
            Packet::ElementUpdate(_) => "element_update",
            Packet::ElementDelete(_) => "element_delete",
            Packet::HallwayAdd(_) => "hallway_add",
            Packet::HallwayUpdate(_) => "hallway_update",
            Packet::HallwayDelete(_) => "hallway_delete",
            Packet::Message(_) => "message",
            Packet::GetMessages(_) => "get_messages",
            Packet::Messages(_) => "messages",
            Packet::FriendRequest(_) => "friend_request",
            Packet::FriendUpdate(_) => "friend_update",
            Packet::QueueJoin(_) => "queue_join",
            Packet::QueueRemove(_) => "queue_remove",
            Packet::QueueSubscribe(_) => "queue_subscribe",
            Packet::QueueUnsubscribe(_) => "queue_unsubscribe",
            Packet::QueueUpdateHacker(_) => "queue_update_hacker",
            Packet::QueueUpdateSponsor(_) => "queue_update_sponsor",
            Packet::EmailCode(_) => "email_code",
            Packet::AddEmail(_) => "add_email",
            Packet::Event(_) => "event",
            Packet::GetAchievements(_) => "get_achievements",
            Packet::Achievements(_) => "achievements",
            Packet::AchievementNotification(_) => "achievement_notification",
            Packet::Song(_) => "song",
            Packet::SongEnded(_) => "song_ended",
            Packet::GetMap(_) => "get_map",
            Packet::UpdateMap(_) => "update_map",
            Packet::Map(_) => "map",
        }
    }

    /// Whether a sender may issue this packet. `character_id` is empty for
    /// connections that have not authenticated yet.
    pub fn allowed(&self, character_id: &str, role: Role) -> bool {
        let authenticated = !character_id.is_empty();

        match self {
            Packet::Join(_) | Packet::Auth(_) | Packet::EmailCode(_) => true,

            // Produced by the server only
            Packet::Init(_)
            | Packet::Leave(_)
            | Packet::Error(_)
            | Packet::Messages(_)
            | Packet::FriendUpdate(_)
            | Packet::QueueUpdateHacker(_)
            | Packet::QueueUpdateSponsor(_)
            | Packet::Achievements(_)
            | Packet::AchievementNotification(_)
            | Packet::SongEnded(_)
            | Packet::Map(_) => false,

            Packet::ElementAdd(_)
            | Packet::ElementUpdate(_)
            | Packet::ElementDelete(_)
            | Packet::HallwayAdd(_)
            | Packet::HallwayUpdate(_)
            | Packet::HallwayDelete(_)
            | Packet::AddEmail(_) => authenticated && role == Role::Organizer,

            Packet::QueueSubscribe(_) | Packet::QueueUnsubscribe(_) => {
                authenticated && matches!(role, Role::SponsorRep | Role::Organizer)
            }

            Packet::QueueRemove(p) => {
                authenticated
                    && (matches!(role, Role::SponsorRep | Role::Organizer)
                        || p.character_id == character_id)
            }

            _ => authenticated,
        }
    }
}

/// Teleport coordinates live strictly inside (0, 1); anything else lands in
/// the middle of the room.
pub fn clamp_coordinate(value: f64) -> f64 {
    if value > 0.0 && value < 1.0 {
        value
    } else {
        0.5
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Store key of the thread between two characters. The participant with the
/// smaller hash comes first, so both sides resolve the same key.
pub fn conversation_key(a: &str, b: &str) -> String {
    let (ha, hb) = (fnv1a32(a.as_bytes()), fnv1a32(b.as_bytes()));
    let a_first = match ha.cmp(&hb) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        // Colliding hashes fall back to byte order
        std::cmp::Ordering::Equal => a <= b,
    };

    if a_first {
        format!("conversation:{a}:{b}")
    } else {
        format!("conversation:{b}:{a}")
    }
}

pub fn is_ascii_text(text: &str) -> bool {
    text.is_ascii()
}
