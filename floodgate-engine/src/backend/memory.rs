//! Process-local fallback backend
//!
//! A single spawned task owns the [`MemoryStore`] and processes
//! commands from an mpsc channel, so concurrent request tasks get
//! per-key atomicity through event-loop serialization rather than a
//! lock. The store's periodic sweep runs inside the actor, piggybacked
//! on mutations.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};

use super::{CounterBackend, TokenVerdict, WindowSlot};
use crate::error::BackendError;
use floodgate::{CounterStore, MemoryStore};

/// Commands understood by the store actor.
enum CounterCommand {
    IncrementWindow {
        key: String,
        width: Duration,
        now: SystemTime,
        reply: oneshot::Sender<Result<WindowSlot, String>>,
    },
    ConsumeTokens {
        key: String,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
        reply: oneshot::Sender<Result<TokenVerdict, String>>,
    },
    WindowCount {
        key: String,
        width: Duration,
        now: SystemTime,
        reply: oneshot::Sender<Result<u64, String>>,
    },
    SetFlag {
        key: String,
        ttl: Duration,
        now: SystemTime,
        reply: oneshot::Sender<Result<(), String>>,
    },
    FlagExpiry {
        key: String,
        now: SystemTime,
        reply: oneshot::Sender<Result<Option<SystemTime>, String>>,
    },
    RemovePrefix {
        prefix: String,
        reply: oneshot::Sender<Result<usize, String>>,
    },
}

/// Cloneable handle to the store actor.
#[derive(Clone)]
pub struct MemoryBackend {
    tx: mpsc::Sender<CounterCommand>,
}

impl MemoryBackend {
    /// Spawn the actor that owns `store` and return a handle to it.
    pub fn spawn(buffer_size: usize, store: MemoryStore) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        tokio::spawn(run_actor(rx, store));
        MemoryBackend { tx }
    }

    async fn dispatch<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, String>>) -> CounterCommand,
    ) -> Result<T, BackendError> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BackendError::Internal("counter store actor has shut down".into()))?;

        rx.await
            .map_err(|_| BackendError::Internal("counter store actor dropped reply".into()))?
            .map_err(BackendError::Internal)
    }
}

async fn run_actor(mut rx: mpsc::Receiver<CounterCommand>, mut store: MemoryStore) {
    while let Some(cmd) = rx.recv().await {
        // Ignore send errors: the requester may have timed out
        match cmd {
            CounterCommand::IncrementWindow {
                key,
                width,
                now,
                reply,
            } => {
                let _ = reply.send(store.increment_window(&key, width, now));
            }
            CounterCommand::ConsumeTokens {
                key,
                capacity,
                refill_per_sec,
                requested,
                now,
                reply,
            } => {
                let _ = reply.send(store.consume_tokens(
                    &key,
                    capacity,
                    refill_per_sec,
                    requested,
                    now,
                ));
            }
            CounterCommand::WindowCount {
                key,
                width,
                now,
                reply,
            } => {
                let _ = reply.send(store.window_count(&key, width, now));
            }
            CounterCommand::SetFlag {
                key,
                ttl,
                now,
                reply,
            } => {
                let _ = reply.send(store.set_flag(&key, ttl, now));
            }
            CounterCommand::FlagExpiry { key, now, reply } => {
                let _ = reply.send(store.flag_expiry(&key, now));
            }
            CounterCommand::RemovePrefix { prefix, reply } => {
                let _ = reply.send(store.remove_prefix(&prefix));
            }
        }
    }

    tracing::info!("counter store actor shutting down");
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    async fn increment_window(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, BackendError> {
        let key = key.to_string();
        self.dispatch(|reply| CounterCommand::IncrementWindow {
            key,
            width,
            now,
            reply,
        })
        .await
    }

    async fn consume_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, BackendError> {
        let key = key.to_string();
        self.dispatch(|reply| CounterCommand::ConsumeTokens {
            key,
            capacity,
            refill_per_sec,
            requested,
            now,
            reply,
        })
        .await
    }

    async fn window_count(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<u64, BackendError> {
        let key = key.to_string();
        self.dispatch(|reply| CounterCommand::WindowCount {
            key,
            width,
            now,
            reply,
        })
        .await
    }

    async fn set_flag(
        &self,
        key: &str,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<(), BackendError> {
        let key = key.to_string();
        self.dispatch(|reply| CounterCommand::SetFlag {
            key,
            ttl,
            now,
            reply,
        })
        .await
    }

    async fn flag_expiry(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<SystemTime>, BackendError> {
        let key = key.to_string();
        self.dispatch(|reply| CounterCommand::FlagExpiry { key, now, reply })
            .await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let prefix = prefix.to_string();
        self.dispatch(|reply| CounterCommand::RemovePrefix { prefix, reply })
            .await
    }

    async fn ping(&self) -> Result<(), BackendError> {
        // The actor is alive as long as its channel is open
        if self.tx.is_closed() {
            Err(BackendError::Internal(
                "counter store actor has shut down".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floodgate::MemoryStore;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn increments_through_the_actor() {
        let backend = MemoryBackend::spawn(64, MemoryStore::new());
        let now = SystemTime::now();

        let slot = backend
            .increment_window("fg:u1:chat.send:w60", Duration::from_secs(60), now)
            .await
            .unwrap();
        assert_eq!(slot.count, 1);
    }

    #[tokio::test]
    async fn concurrent_increments_never_lose_updates() {
        let backend = MemoryBackend::spawn(256, MemoryStore::new());
        let now = SystemTime::now();

        let mut tasks = vec![];
        for _ in 0..50 {
            let b = backend.clone();
            tasks.push(tokio::spawn(async move {
                b.increment_window("fg:u1:op:w60", Duration::from_secs(60), now)
                    .await
                    .unwrap()
            }));
        }

        let mut max_count = 0;
        for task in tasks {
            max_count = max_count.max(task.await.unwrap().count);
        }
        // Every increment was observed exactly once
        assert_eq!(max_count, 50);
    }

    #[tokio::test]
    async fn ping_reflects_actor_liveness() {
        let backend = MemoryBackend::spawn(8, MemoryStore::new());
        assert!(backend.ping().await.is_ok());
    }
}
