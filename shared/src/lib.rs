//! # Playground Shared Types
//!
//! Data shared by the ingest server and anything that speaks to it: the
//! entity records kept in the store and the JSON packets exchanged with
//! clients.
//!
//! ## Entity Models (`models`)
//! Plain records (characters, rooms, elements, hallways, messages, queue
//! entries, songs, map locations). Each one has two representations:
//! - camelCase JSON for the wire
//! - a flat string hash for the store, through [`StoreRecord`]
//!
//! ## Packet Protocol (`packets`)
//! A closed set of messages discriminated by their `type` field. Every
//! packet can be decoded, encoded and checked against the sender's role
//! before it is applied.

pub mod models;
pub mod packets;

pub use models::{
    next_state, Character, Element, ElementAction, Hallway, Location, Message, QueueSubscriber,
    Role, Room, Song, StoreRecord,
};
pub use packets::{clamp_coordinate, conversation_key, is_ascii_text, Packet};

/// Room new characters are placed in.
pub const DEFAULT_ROOM: &str = "lobby";
