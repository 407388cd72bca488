//! Coordination broker contract.
//!
//! Four primitives back the whole pipeline: append-only logs with blocking
//! tail reads, hash records with field-scoped updates, atomic set-if-absent
//! keys with TTL, and channel pub/sub with pattern subscription. Two
//! implementations exist: [`MemoryBroker`] for tests and combined-process
//! runs, and [`RedisBroker`] for production.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cursor value addressing a log from its beginning.
pub const LOG_START: &str = "0";

pub type BrokerHandle = Arc<dyn Broker>;

/// One log record with its broker-assigned, monotone id.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends one entry and returns its id. Ids are monotone per log.
    async fn log_append(
        &self,
        log: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, PipelineError>;

    /// Reads entries with ids greater than `after` (use [`LOG_START`] for
    /// the whole log). With `block`, waits up to that long for new entries;
    /// without, returns immediately. An empty result means the budget
    /// elapsed with nothing new.
    async fn log_read(
        &self,
        log: &str,
        after: &str,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<LogEntry>, PipelineError>;

    /// Id of the newest entry, or [`LOG_START`] when the log is empty.
    /// Followers that want "new entries only" resolve this once and read
    /// after it, so nothing appended between reads is lost.
    async fn log_tail_id(&self, log: &str) -> Result<String, PipelineError>;

    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), PipelineError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, PipelineError>;

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, PipelineError>;

    /// Returns true only if the key was absent and is now set. The key
    /// expires after `ttl` unless refreshed.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, PipelineError>;

    /// Unconditional set, used to refresh TTL-bounded keys.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), PipelineError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError>;

    async fn delete(&self, key: &str) -> Result<(), PipelineError>;

    /// Schedules expiry on an existing key or hash.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PipelineError>;

    /// Lists keys matching a glob pattern. Used only by the low-frequency
    /// reclamation sweep.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PipelineError>;

    /// Atomically replaces the value only if it currently equals
    /// `expected`. Returns whether the swap happened.
    async fn swap_if_equals(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, PipelineError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PipelineError>;

    /// Pattern subscription. Messages arrive as `(channel, payload)`;
    /// delivery is best-effort and unordered across channels.
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<(String, String)>, PipelineError>;
}
