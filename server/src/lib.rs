//! # Playground Ingest Server
//!
//! An ingest is one of several identical servers that terminate client
//! websockets for the Playground virtual venue. Clients join a shared world
//! of rooms, walk around, chat, message each other, queue up to meet
//! sponsors and listen to a shared jukebox. All durable state lives in a
//! shared store; ingests keep nothing but their live connections.
//!
//! ## Data Flow
//!
//! ```text
//! client frame ──► network ──► dispatcher ──► store (atomic batch)
//!                                   │
//!                                   ▼
//!                          hub (local fan-out) ──► client writers
//!                                   │
//!                                   ▼
//!                      replication (pub/sub) ──► peer ingests' hubs
//! ```
//!
//! Every event produced here is delivered to local clients directly and
//! published once on the replication channel. Peers deliver it to their
//! own clients and ignore what they published themselves.
//!
//! ## Module Organization
//!
//! ### Network (`network`)
//! Websocket accept loop, one reader and one writer task per connection.
//!
//! ### Dispatcher (`dispatcher`)
//! Decodes, authorizes and applies each packet. All per-packet failures
//! end here; a bad packet never closes a connection or stops the hub.
//!
//! ### Hub (`hub`, `client_manager`)
//! Owns the registry of local clients and routes events to rooms, single
//! characters or everyone.
//!
//! ### Replication (`replication`)
//! Cross-ingest delivery over the store's pub/sub channel.
//!
//! ### Leader Election (`leader`)
//! Picks one ingest to run periodic world-wide duties such as advancing
//! the jukebox.
//!
//! ### Storage (`store`, `db`)
//! The [`store::Store`] trait with Redis and in-memory backends, and the
//! key schema shared with other Playground tooling.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Settings;
//! use server::dispatcher::Dispatcher;
//! use server::hub::{Hub, HubHandle};
//! use server::network::Server;
//! use server::services::Services;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::default();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let (hub, events) = HubHandle::new(None);
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         store,
//!         hub.clone(),
//!         Services::from_settings(&settings),
//!         &settings,
//!         1,
//!     ));
//!     tokio::spawn(Hub::new(settings.server.max_clients, events, dispatcher.clone()).run());
//!
//!     Server::bind(&settings.bind_address(), hub, dispatcher)
//!         .await?
//!         .run()
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod leader;
pub mod network;
pub mod replication;
pub mod services;
pub mod store;
pub mod utils;
