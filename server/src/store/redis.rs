use super::{Store, StoreError, StoreOp};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{error, info, warn};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Store backed by a Redis server.
///
/// Commands share one multiplexed connection, so `CLIENT SETNAME` and
/// `CLIENT ID` describe the connection this ingest is known by. Each
/// subscription opens its own pub/sub connection.
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| {
            // The url may carry credentials, so it is not logged
            error!("Failed to open Redis client: {}", e);
            StoreError::Redis(e)
        })?;

        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");

        Ok(Self { client, connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn append_op(pipe: &mut redis::Pipeline, op: StoreOp) {
    match op {
        StoreOp::Set { key, value } => {
            pipe.cmd("SET").arg(key).arg(value).ignore();
        }
        StoreOp::Del { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
        StoreOp::HSet { key, fields } => {
            if fields.is_empty() {
                return;
            }
            let cmd = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        StoreOp::HDel { key, field } => {
            pipe.cmd("HDEL").arg(key).arg(field).ignore();
        }
        StoreOp::SAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        StoreOp::SRem { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        StoreOp::RPush { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value).ignore();
        }
        StoreOp::LRem { key, value } => {
            pipe.cmd("LREM").arg(key).arg(0).arg(value).ignore();
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let present: bool = conn.sismember(key, member).await?;
        Ok(present)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn exec(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            append_op(&mut pipe, op);
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Unreadable message on {}: {}", channel, e);
                        continue;
                    }
                };

                if tx.send(payload).is_err() {
                    // Subscriber went away
                    return;
                }
            }
            warn!("Redis subscription to {} ended", channel);
        });

        Ok(rx)
    }

    async fn set_client_name(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn client_id(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let id: i64 = redis::cmd("CLIENT").arg("ID").query_async(&mut conn).await?;
        Ok(id)
    }

    async fn client_list(&self) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let listing: String = redis::cmd("CLIENT")
            .arg("LIST")
            .query_async(&mut conn)
            .await?;
        Ok(listing)
    }
}
