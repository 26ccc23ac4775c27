//! The command surface and the executor actor that owns the engine.
//!
//! One executor task owns the [`KvStore`] and consumes an ordered request
//! channel. A command runs to completion (including any WAL append,
//! MemTable mutation, and flush it triggers) before the next suspension
//! point, so commands submitted on the channel execute in submission order
//! and reads see a consistent point-in-time view. Compaction and the TTL
//! sweep run on periodic ticks of the same loop, never preempting a
//! command.

use crate::config::KvConfig;
use crate::events::Event;
use crate::store::{KvStore, StoreInfo};
use crate::{KvError, KvResult};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// A command accepted by the engine.
#[derive(Debug, Clone)]
pub enum Command {
    Set {
        key: String,
        value: Bytes,
        ttl_ms: Option<u64>,
    },
    Get {
        key: String,
    },
    Del {
        key: String,
    },
    Exists {
        key: String,
    },
    Expire {
        key: String,
        ttl_ms: u64,
    },
    Ttl {
        key: String,
    },
    Incr {
        key: String,
    },
    Decr {
        key: String,
    },
    Keys {
        pattern: Option<String>,
    },
    MGet {
        keys: Vec<String>,
    },
    MSet {
        entries: Vec<(String, Bytes, Option<u64>)>,
    },
    FlushAll,
    Info,
}

/// A successful command result.
#[derive(Debug, Clone)]
pub enum Output {
    Unit,
    Value(Option<Bytes>),
    Bool(bool),
    Int(i64),
    Keys(Vec<String>),
    Values(Vec<Option<Bytes>>),
    Info(StoreInfo),
}

/// A request delivered over the command channel.
pub struct Request {
    pub id: u64,
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

/// The engine's answer to one request. Every command yields exactly one
/// response, success or failure; commands are never silently dropped.
#[derive(Debug)]
pub struct Response {
    pub id: u64,
    pub result: KvResult<Output>,
}

/// The actor that owns the engine state and drains the command channel.
pub struct Executor {
    store: KvStore,
    requests: mpsc::Receiver<Request>,
}

impl Executor {
    /// Open a store and spawn its executor task. Returns a handle for
    /// submitting commands and the task's join handle.
    pub fn spawn(config: KvConfig) -> KvResult<(StoreHandle, JoinHandle<()>)> {
        let store = KvStore::open(config.clone())?;
        Ok(Self::spawn_with_store(store, &config))
    }

    /// Spawn the executor for an already-open store (e.g. one built on a
    /// test clock or reconstructed from a WAL seed).
    pub fn spawn_with_store(store: KvStore, config: &KvConfig) -> (StoreHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let handle = StoreHandle {
            requests: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            events: store.event_sender(),
        };
        let executor = Executor {
            store,
            requests: rx,
        };
        let compaction_period = Duration::from_millis(config.compaction_interval_ms.max(1));
        let sweep_period = Duration::from_millis(config.sweep_interval_ms.max(1));
        let task = tokio::spawn(executor.run(compaction_period, sweep_period));
        (handle, task)
    }

    async fn run(self, compaction_period: Duration, sweep_period: Duration) {
        let Executor {
            mut store,
            mut requests,
        } = self;

        let start = tokio::time::Instant::now();
        let mut compaction_tick =
            tokio::time::interval_at(start + compaction_period, compaction_period);
        compaction_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval_at(start + sweep_period, sweep_period);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_request = requests.recv() => {
                    let Some(request) = maybe_request else { break };
                    Self::handle_request(&mut store, request);
                }
                _ = compaction_tick.tick() => {
                    // At most one level's merge step per tick; a tick firing
                    // mid-compaction is skipped by the in-progress guard.
                    if let Err(e) = store.run_compaction_step() {
                        tracing::warn!(error = %e, "scheduled compaction failed");
                    }
                }
                _ = sweep_tick.tick() => {
                    store.sweep_expired();
                }
            }
        }
        tracing::debug!("executor stopped: command channel closed");
    }

    fn handle_request(store: &mut KvStore, request: Request) {
        let result = Self::dispatch(store, request.command);
        // The response is produced before the next command starts. A caller
        // that abandoned its timeout dropped the receiver; the response is
        // simply discarded.
        let _ = request.reply.send(Response {
            id: request.id,
            result,
        });

        // A flush during the command may have pushed L0 over its threshold;
        // compaction runs to completion between commands.
        if store.compaction_pending() {
            if let Err(e) = store.run_compactions() {
                tracing::warn!(error = %e, "post-flush compaction failed");
            }
        }
    }

    fn dispatch(store: &mut KvStore, command: Command) -> KvResult<Output> {
        match command {
            Command::Set { key, value, ttl_ms } => {
                store.set(key, value, ttl_ms)?;
                Ok(Output::Unit)
            }
            Command::Get { key } => Ok(Output::Value(store.get(&key)?)),
            Command::Del { key } => Ok(Output::Bool(store.del(&key)?)),
            Command::Exists { key } => Ok(Output::Bool(store.exists(&key)?)),
            Command::Expire { key, ttl_ms } => Ok(Output::Bool(store.expire(&key, ttl_ms)?)),
            Command::Ttl { key } => Ok(Output::Int(store.ttl(&key)?)),
            Command::Incr { key } => Ok(Output::Int(store.incr(&key)?)),
            Command::Decr { key } => Ok(Output::Int(store.decr(&key)?)),
            Command::Keys { pattern } => Ok(Output::Keys(store.keys(pattern.as_deref())?)),
            Command::MGet { keys } => Ok(Output::Values(store.mget(&keys)?)),
            Command::MSet { entries } => {
                store.mset(entries)?;
                Ok(Output::Unit)
            }
            Command::FlushAll => {
                store.flushall();
                Ok(Output::Unit)
            }
            Command::Info => Ok(Output::Info(store.info())),
        }
    }
}

/// A cloneable client handle to the executor's command channel.
#[derive(Clone)]
pub struct StoreHandle {
    requests: mpsc::Sender<Request>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<Event>,
}

impl StoreHandle {
    /// Submit a command and await its response.
    pub async fn execute(&self, command: Command) -> KvResult<Output> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { id, command, reply })
            .await
            .map_err(|_| KvError::Storage("engine executor has shut down".to_string()))?;
        match response.await {
            Ok(resp) => resp.result,
            Err(_) => Err(KvError::Storage(
                "engine executor dropped the request".to_string(),
            )),
        }
    }

    /// Submit a command with a caller-side deadline. The engine still
    /// completes the command on a timeout; the response is discarded.
    pub async fn execute_timeout(&self, command: Command, timeout: Duration) -> KvResult<Output> {
        match tokio::time::timeout(timeout, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout(format!(
                "no response within {timeout:?}"
            ))),
        }
    }

    /// Subscribe to the engine's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl_ms: Option<u64>,
    ) -> KvResult<()> {
        match self
            .execute(Command::Set {
                key: key.into(),
                value: value.into(),
                ttl_ms,
            })
            .await?
        {
            Output::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, key: impl Into<String>) -> KvResult<Option<Bytes>> {
        match self.execute(Command::Get { key: key.into() }).await? {
            Output::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    pub async fn del(&self, key: impl Into<String>) -> KvResult<bool> {
        match self.execute(Command::Del { key: key.into() }).await? {
            Output::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exists(&self, key: impl Into<String>) -> KvResult<bool> {
        match self.execute(Command::Exists { key: key.into() }).await? {
            Output::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn expire(&self, key: impl Into<String>, ttl_ms: u64) -> KvResult<bool> {
        match self
            .execute(Command::Expire {
                key: key.into(),
                ttl_ms,
            })
            .await?
        {
            Output::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ttl(&self, key: impl Into<String>) -> KvResult<i64> {
        match self.execute(Command::Ttl { key: key.into() }).await? {
            Output::Int(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn incr(&self, key: impl Into<String>) -> KvResult<i64> {
        match self.execute(Command::Incr { key: key.into() }).await? {
            Output::Int(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn decr(&self, key: impl Into<String>) -> KvResult<i64> {
        match self.execute(Command::Decr { key: key.into() }).await? {
            Output::Int(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn keys(&self, pattern: Option<&str>) -> KvResult<Vec<String>> {
        match self
            .execute(Command::Keys {
                pattern: pattern.map(str::to_string),
            })
            .await?
        {
            Output::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mget(&self, keys: Vec<String>) -> KvResult<Vec<Option<Bytes>>> {
        match self.execute(Command::MGet { keys }).await? {
            Output::Values(values) => Ok(values),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mset(&self, entries: Vec<(String, Bytes, Option<u64>)>) -> KvResult<()> {
        match self.execute(Command::MSet { entries }).await? {
            Output::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn flushall(&self) -> KvResult<()> {
        match self.execute(Command::FlushAll).await? {
            Output::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn info(&self) -> KvResult<StoreInfo> {
        match self.execute(Command::Info).await? {
            Output::Info(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(output: Output) -> KvError {
    KvError::Unknown(format!("unexpected response shape: {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn spawn_manual() -> (StoreHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = KvConfig::default();
        let store = KvStore::open_with_clock(config.clone(), clock.clone()).unwrap();
        let (handle, _task) = Executor::spawn_with_store(store, &config);
        (handle, clock)
    }

    #[tokio::test]
    async fn test_roundtrip_set_get() {
        let (store, _) = spawn_manual();
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(bytes("1")));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counters_and_ttl() {
        let (store, clock) = spawn_manual();
        store.set("x", "10", None).await.unwrap();
        assert_eq!(store.incr("x").await.unwrap(), 11);
        assert_eq!(store.incr("x").await.unwrap(), 12);
        assert_eq!(store.decr("x").await.unwrap(), 11);

        store.expire("x", 2_000).await.unwrap();
        assert_eq!(store.ttl("x").await.unwrap(), 2);
        clock.advance(2_500);
        assert_eq!(store.get("x").await.unwrap(), None);
        assert!(!store.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_batched_and_pattern_commands() {
        let (store, _) = spawn_manual();
        store
            .mset(vec![
                ("user:1".into(), bytes("a"), None),
                ("user:2".into(), bytes("b"), None),
                ("session:1".into(), bytes("c"), None),
            ])
            .await
            .unwrap();

        let values = store
            .mget(vec!["user:1".into(), "nope".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(bytes("a")), None]);

        let mut keys = store.keys(Some("user:*")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);

        store.flushall().await.unwrap();
        assert!(store.keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors_surface_to_caller() {
        let (store, _) = spawn_manual();
        let err = store.set("", "v", None).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = store.set("k", "v", Some(0)).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        // Nothing was written.
        assert_eq!(store.info().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_commands_execute_in_submission_order() {
        let (store, _) = spawn_manual();
        for i in 0..50 {
            store.set("seq", format!("{i}").into_bytes(), None).await.unwrap();
        }
        assert_eq!(store.get("seq").await.unwrap(), Some(bytes("49")));
        // Versions rose monotonically: 50 writes to one key.
        assert_eq!(store.info().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let (store, _) = spawn_manual();
        let mut events = store.subscribe();

        store.set("a", "1", None).await.unwrap();
        store.del("a").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Set { ref key, .. } if key == "a"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Del { ref key, deleted: true } if key == "a"
        ));
    }

    #[tokio::test]
    async fn test_caller_timeout_when_executor_never_answers() {
        // A handle whose channel has no executor behind it: the send is
        // buffered and the response never comes.
        let (tx, _rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(8);
        let handle = StoreHandle {
            requests: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        };

        let err = handle
            .execute_timeout(
                Command::Get { key: "k".into() },
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_is_an_error() {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = KvConfig::default();
        let store = KvStore::open_with_clock(config.clone(), clock).unwrap();
        let (handle, task) = Executor::spawn_with_store(store, &config);

        handle.set("k", "v", None).await.unwrap();
        task.abort();
        let _ = task.await;

        let err = handle.get("k").await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }

    #[tokio::test]
    async fn test_post_command_compaction_trigger() {
        let clock = Arc::new(ManualClock::new(1_000));
        // Flush after every write so L0 fills up quickly.
        let config = KvConfig::default().with_max_memtable_size_mb(0);
        let store = KvStore::open_with_clock(config.clone(), clock.clone()).unwrap();
        let (handle, _task) = Executor::spawn_with_store(store, &config);

        for i in 0..4 {
            clock.advance(10);
            handle.set(format!("k{i}"), "v", None).await.unwrap();
        }

        // The post-command trigger compacts L0 as soon as it crosses the
        // threshold, without waiting for the periodic tick.
        let info = handle.info().await.unwrap();
        assert!(!info.compaction_history.is_empty());
        let all_present = handle.keys(None).await.unwrap();
        assert_eq!(all_present.len(), 4);
    }
}
