//! In-process optimistic store.
//!
//! Every committed write bumps a global sequence and stamps the written keys
//! with it. A transaction remembers the stamp of each key it read (zero for an
//! absent key) and its commit is rejected with a conflict when any of those
//! stamps moved. Blind writes are never checked.

use super::{Datastore, EntityKey, Query, StoredEntity, Transaction};
use crate::error::CounterError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Failure injected into an upcoming commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    Conflict,
    Fatal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub transactions: u64,
    pub gets: u64,
    pub upserts: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub rollbacks: u64,
    pub queries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transactions: AtomicU64,
    gets: AtomicU64,
    upserts: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    rollbacks: AtomicU64,
    queries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct Versioned {
    entity: StoredEntity,
    seq: u64,
}

#[derive(Debug, Default)]
struct Shared {
    entries: BTreeMap<EntityKey, Versioned>,
    seq: u64,
    faults: VecDeque<CommitFault>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    shared: Arc<Mutex<Shared>>,
    counters: Arc<Counters>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an entity outside any transaction, as a committed write.
    pub fn put(&self, entity: StoredEntity) {
        let mut shared = self.shared.lock();
        shared.seq += 1;
        let seq = shared.seq;
        shared
            .entries
            .insert(entity.key.clone(), Versioned { entity, seq });
    }

    /// Latest committed state of `key`, read outside any transaction.
    pub fn peek(&self, key: &EntityKey) -> Option<StoredEntity> {
        self.shared
            .lock()
            .entries
            .get(key)
            .map(|v| v.entity.clone())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `times` commits fail with `fault`, in order.
    pub fn fail_next_commits(&self, fault: CommitFault, times: usize) {
        let mut shared = self.shared.lock();
        shared.faults.extend(std::iter::repeat_n(fault, times));
    }

    pub fn stats(&self) -> StoreStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreStats {
            transactions: load(&self.counters.transactions),
            gets: load(&self.counters.gets),
            upserts: load(&self.counters.upserts),
            commits: load(&self.counters.commits),
            conflicts: load(&self.counters.conflicts),
            rollbacks: load(&self.counters.rollbacks),
            queries: load(&self.counters.queries),
        }
    }
}

impl Datastore for MemoryDatastore {
    type Transaction = MemoryTransaction;

    fn transaction(&self) -> MemoryTransaction {
        Counters::bump(&self.counters.transactions);
        MemoryTransaction {
            store: self.clone(),
            state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<StoredEntity>, CounterError> {
        Counters::bump(&self.counters.queries);
        let shared = self.shared.lock();
        let rows = shared
            .entries
            .values()
            .filter(|v| query.matches(&v.entity))
            .map(|v| {
                let mut entity = v.entity.clone();
                if !query.projection.is_empty() {
                    entity.data = entity.data.project(&query.projection);
                }
                entity
            })
            .collect();
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Running,
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
struct TxState {
    phase: Phase,
    read_set: BTreeMap<EntityKey, u64>,
    writes: BTreeMap<EntityKey, StoredEntity>,
}

impl TxState {
    fn ensure_running(&self) -> Result<(), CounterError> {
        match self.phase {
            Phase::Running => Ok(()),
            other => Err(CounterError::store(format!(
                "transaction is not running (phase {other:?})"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransaction {
    store: MemoryDatastore,
    state: Arc<Mutex<TxState>>,
}

impl Transaction for MemoryTransaction {
    async fn begin(&self) -> Result<(), CounterError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return Err(CounterError::store("transaction already started"));
        }
        state.phase = Phase::Running;
        Ok(())
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<StoredEntity>, CounterError> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        Counters::bump(&self.store.counters.gets);
        let shared = self.store.shared.lock();
        let current = shared.entries.get(key);
        state
            .read_set
            .entry(key.clone())
            .or_insert_with(|| current.map_or(0, |v| v.seq));
        Ok(current.map(|v| v.entity.clone()))
    }

    fn upsert(&self, entity: StoredEntity) -> Result<(), CounterError> {
        let mut state = self.state.lock();
        state.ensure_running()?;
        Counters::bump(&self.store.counters.upserts);
        state.writes.insert(entity.key.clone(), entity);
        Ok(())
    }

    async fn commit(&self) -> Result<(), CounterError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_running()?;
        let mut shared = self.store.shared.lock();

        if let Some(fault) = shared.faults.pop_front() {
            state.phase = Phase::RolledBack;
            return Err(match fault {
                CommitFault::Conflict => {
                    Counters::bump(&self.store.counters.conflicts);
                    CounterError::Conflict("injected commit conflict".into())
                }
                CommitFault::Fatal => CounterError::store("injected commit failure"),
            });
        }

        for (key, seen) in &state.read_set {
            let current = shared.entries.get(key).map_or(0, |v| v.seq);
            if current != *seen {
                state.phase = Phase::RolledBack;
                Counters::bump(&self.store.counters.conflicts);
                debug!(%key, seen, current, "memory store commit conflict");
                return Err(CounterError::Conflict(format!(
                    "{key} changed since it was read"
                )));
            }
        }

        if !state.writes.is_empty() {
            shared.seq += 1;
            let seq = shared.seq;
            for (key, entity) in std::mem::take(&mut state.writes) {
                shared.entries.insert(key, Versioned { entity, seq });
            }
        }
        state.phase = Phase::Committed;
        Counters::bump(&self.store.counters.commits);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), CounterError> {
        let mut state = self.state.lock();
        if state.phase == Phase::Committed {
            return Err(CounterError::store("cannot roll back a committed transaction"));
        }
        state.phase = Phase::RolledBack;
        state.writes.clear();
        Counters::bump(&self.store.counters.rollbacks);
        Ok(())
    }
}
