//! Production broker over Redis: streams for the logs, hashes for stream
//! records, `SET NX PX` for ownership and liveness keys, and pattern
//! pub/sub for progress fan-out. The reclamation compare-and-swap runs as a
//! Lua script so the read and the rewrite are one atomic step.

use super::{Broker, LOG_START, LogEntry, PipelineError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SWAP_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    swap_script: redis::Script,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(%url, "connected to broker");
        Ok(Self {
            client,
            conn,
            swap_script: redis::Script::new(SWAP_IF_EQUALS),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn entries_from_reply(reply: StreamReadReply) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let mut fields = HashMap::with_capacity(id.map.len());
            for (name, value) in id.map {
                match redis::from_redis_value::<String>(&value) {
                    Ok(value) => {
                        fields.insert(name, value);
                    }
                    Err(err) => warn!(%name, %err, "non-string log field skipped"),
                }
            }
            entries.push(LogEntry { id: id.id, fields });
        }
    }
    entries
}

#[async_trait]
impl Broker for RedisBroker {
    async fn log_append(
        &self,
        log: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, PipelineError> {
        let mut conn = self.conn();
        let id: String = conn.xadd(log, "*", &fields).await?;
        Ok(id)
    }

    async fn log_read(
        &self,
        log: &str,
        after: &str,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let mut conn = self.conn();
        let mut options = StreamReadOptions::default().count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[log], &[after], &options).await?;
        Ok(entries_from_reply(reply))
    }

    async fn log_tail_id(&self, log: &str) -> Result<String, PipelineError> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamRangeReply =
            conn.xrevrange_count(log, "+", "-", 1).await?;
        Ok(reply
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| LOG_START.to_string()))
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), PipelineError> {
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, &fields).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, PipelineError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, PipelineError> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(key, field, by).await?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, PipelineError> {
        let mut conn = self.conn();
        let mut options = SetOptions::default().conditional_set(ExistenceCheck::NX);
        if let Some(ttl) = ttl {
            options = options.with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
        }
        let reply: Option<String> = conn.set_options(key, value, options).await?;
        Ok(reply.is_some())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let options =
                    SetOptions::default().with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
                let _: Option<String> = conn.set_options(key, value, options).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PipelineError> {
        let mut conn = self.conn();
        let _: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PipelineError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn swap_if_equals(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, PipelineError> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .swap_script
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<(String, String)>, PipelineError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let channel = message.get_channel_name().to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%channel, %err, "undecodable pub/sub payload dropped");
                        continue;
                    }
                };
                if tx.send((channel, payload)).is_err() {
                    break;
                }
            }
            debug!(%pattern, "pub/sub subscription closed");
        });

        Ok(rx)
    }
}
