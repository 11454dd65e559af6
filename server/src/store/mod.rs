//! Shared state store
//!
//! Every ingest reads and writes world state through a [`Store`]. Two
//! implementations exist:
//! - [`RedisStore`] talks to a real Redis server and is what a multi-ingest
//!   deployment uses
//! - [`MemoryStore`] keeps everything in process; extra connections to the
//!   same backend behave like separate ingests, which makes replication and
//!   leader election testable without Redis
//!
//! All writes go through [`Store::exec`], which applies a batch atomically.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("value of {key}.{field} is not an integer")]
    NotInteger { key: String, field: String },
    #[error("increment of {key}.{field} would overflow")]
    Overflow { key: String, field: String },
    #[error("store connection closed")]
    Closed,
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    HDel { key: String, field: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    RPush { key: String, value: String },
    /// Removes every occurrence of `value`.
    LRem { key: String, value: String },
}

impl StoreOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        StoreOp::Del { key: key.into() }
    }

    pub fn hset(key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        StoreOp::HSet {
            key: key.into(),
            fields,
        }
    }

    pub fn hset_one(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        StoreOp::HSet {
            key: key.into(),
            fields: vec![(field.into(), value.into())],
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        StoreOp::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn rpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::RPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn lrem(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::LRem {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Capability set the server needs from the shared store.
///
/// List ranges follow Redis semantics: indices are inclusive and negative
/// values count from the tail.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Adds `member` to a set in one step, returning whether it was new.
    /// Batches cannot report this, so check-then-add races go through here.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Applies all operations atomically, in order.
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), StoreError>;

    /// Messages published on `channel` from now on. The receiver yields
    /// `None` once the subscription is lost.
    async fn subscribe(&self, channel: &str)
        -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StoreError>;

    async fn set_client_name(&self, name: &str) -> Result<(), StoreError>;

    /// Identifier the store assigned to this connection. Identifiers grow
    /// monotonically, so a lower id means an older connection.
    async fn client_id(&self) -> Result<i64, StoreError>;

    /// Connection listing in Redis `CLIENT LIST` format.
    async fn client_list(&self) -> Result<String, StoreError>;
}
