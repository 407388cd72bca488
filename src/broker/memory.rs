//! In-process broker used by tests and `role = "all"` development runs.
//!
//! Semantics mirror the production backend: monotone log ids, lazy TTL
//! expiry, and best-effort pub/sub fan-out. Blocking tail reads are built
//! on a per-log version counter so appends between two reads are never
//! missed.

use super::{Broker, LogEntry, PipelineError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

#[derive(Default)]
pub struct MemoryBroker {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    logs: HashMap<String, LogState>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
    subscribers: Vec<Subscriber>,
}

struct LogState {
    entries: Vec<LogEntry>,
    version: watch::Sender<u64>,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            version: watch::Sender::new(0),
        }
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl Shared {
    /// Drops keys whose TTL elapsed. Called at the top of every keyspace
    /// operation; logs never expire.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expiries.remove(&key);
            self.strings.remove(&key);
            self.hashes.remove(&key);
        }
    }

    fn log(&mut self, name: &str) -> &mut LogState {
        self.logs.entry(name.to_string()).or_default()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_after(log: &LogState, after: u64, count: usize) -> Vec<LogEntry> {
        log.entries
            .iter()
            .skip(after as usize)
            .take(count)
            .cloned()
            .collect()
    }
}

fn parse_cursor(after: &str) -> Result<u64, PipelineError> {
    after
        .parse::<u64>()
        .map_err(|_| PipelineError::broker(format!("bad log cursor {after:?}")))
}

/// Glob match supporting `*` wildcards, enough for `events:*` and
/// `owner:*` subscriptions.
fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, rest)) => {
            if !value.starts_with(prefix) {
                return false;
            }
            let value = &value[prefix.len()..];
            if rest.is_empty() {
                return true;
            }
            (0..=value.len()).any(|skip| glob_match(rest, &value[skip..]))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn log_append(
        &self,
        log: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        let log = shared.log(log);
        let id = (log.entries.len() as u64 + 1).to_string();
        log.entries.push(LogEntry {
            id: id.clone(),
            fields: fields.into_iter().collect(),
        });
        let version = log.entries.len() as u64;
        let _ = log.version.send(version);
        Ok(id)
    }

    async fn log_read(
        &self,
        log: &str,
        after: &str,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let after = parse_cursor(after)?;
        let deadline = block.map(|budget| Instant::now() + budget);

        loop {
            let mut version_rx = {
                let mut shared = self.shared.lock().expect("broker lock");
                let log = shared.log(log);
                let entries = Self::entries_after(log, after, count);
                if !entries.is_empty() {
                    return Ok(entries);
                }
                log.version.subscribe()
            };

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, version_rx.changed())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn log_tail_id(&self, log: &str) -> Result<String, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        Ok(shared.log(log).entries.len().to_string())
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        let hash = shared.hashes.entry(key.to_string()).or_default();
        hash.extend(fields);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        Ok(shared.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        let hash = shared.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        if shared.strings.contains_key(key) {
            return Ok(false);
        }
        shared.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            shared.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        shared.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                shared.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                shared.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        Ok(shared.strings.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.strings.remove(key);
        shared.hashes.remove(key);
        shared.expiries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        if shared.strings.contains_key(key) || shared.hashes.contains_key(key) {
            shared.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        let mut keys: Vec<String> = shared
            .strings
            .keys()
            .chain(shared.hashes.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn swap_if_equals(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.purge_expired();
        match shared.strings.get(key) {
            Some(current) if current == expected => {
                shared.strings.insert(key.to_string(), new.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PipelineError> {
        let mut shared = self.shared.lock().expect("broker lock");
        shared.subscribers.retain(|sub| {
            if !glob_match(&sub.pattern, channel) {
                return true;
            }
            sub.tx
                .send((channel.to_string(), payload.to_string()))
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<(String, String)>, PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock().expect("broker lock");
        shared.subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn glob_matching() {
        assert!(glob_match("events:*", "events:s1"));
        assert!(glob_match("owner:*", "owner:abc"));
        assert!(!glob_match("events:*", "heartbeat:w1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact-no"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let broker = MemoryBroker::new();
        assert!(broker.set_if_absent("owner:s1", "w1", None).await.unwrap());
        assert!(!broker.set_if_absent("owner:s1", "w2", None).await.unwrap());
        assert_eq!(broker.get("owner:s1").await.unwrap().as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn only_one_concurrent_claimer_wins() {
        let broker = Arc::new(MemoryBroker::new());
        let mut claims = Vec::new();
        for worker in 0..8 {
            let broker = broker.clone();
            claims.push(tokio::spawn(async move {
                broker
                    .set_if_absent("owner:s1", &format!("w{worker}"), None)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn ttl_keys_expire() {
        let broker = MemoryBroker::new();
        broker
            .set("heartbeat:w1", "alive", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(broker.get("heartbeat:w1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(broker.get("heartbeat:w1").await.unwrap().is_none());
        // Expired heartbeat frees the key for set-if-absent.
        assert!(
            broker
                .set_if_absent("heartbeat:w1", "alive", None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn log_reads_resume_from_cursor() {
        let broker = MemoryBroker::new();
        let first = broker
            .log_append("control", vec![("event".into(), "a".into())])
            .await
            .unwrap();
        broker
            .log_append("control", vec![("event".into(), "b".into())])
            .await
            .unwrap();

        let all = broker.log_read("control", "0", None, 100).await.unwrap();
        assert_eq!(all.len(), 2);

        let rest = broker.log_read("control", &first, None, 100).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].field("event"), Some("b"));
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let broker = Arc::new(MemoryBroker::new());
        let tail = broker.log_tail_id("chunks:s1").await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .log_read("chunks:s1", &tail, Some(Duration::from_secs(5)), 10)
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .log_append("chunks:s1", vec![("seq".into(), "0".into())])
            .await
            .unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("seq"), Some("0"));
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let broker = MemoryBroker::new();
        let entries = broker
            .log_read("chunks:s1", "0", Some(Duration::from_millis(20)), 10)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn pattern_subscription_sees_all_stream_channels() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe("events:*").await.unwrap();
        broker.publish("events:s1", "one").await.unwrap();
        broker.publish("events:s2", "two").await.unwrap();
        broker.publish("heartbeat:w1", "ignored").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("events:s1".into(), "one".into()));
        assert_eq!(rx.recv().await.unwrap(), ("events:s2".into(), "two".into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hash_incr_counts_from_zero() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.hash_incr("state:s1", "chunk_count", 1).await.unwrap(), 1);
        assert_eq!(broker.hash_incr("state:s1", "chunk_count", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn swap_if_equals_requires_the_expected_owner() {
        let broker = MemoryBroker::new();
        broker.set("owner:s1", "w-dead", None).await.unwrap();
        assert!(!broker.swap_if_equals("owner:s1", "w-other", "w2").await.unwrap());
        assert!(broker.swap_if_equals("owner:s1", "w-dead", "w2").await.unwrap());
        assert_eq!(broker.get("owner:s1").await.unwrap().as_deref(), Some("w2"));
    }
}
