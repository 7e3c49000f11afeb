//! Connection, exchange and presentation registries.
//!
//! Each record lives behind its own async mutex; that mutex is the record's
//! serialization boundary. The index maps (by id, by thread, by peer) sit
//! behind one short-lived `RwLock` per registry that is never held across an
//! await or a storage call, so a slow transition or a slow disk on one
//! record never blocks lookups of another.
//!
//! # Commit protocol
//!
//! ```text
//! lock record ─> clone ─> transition the clone ─> persist clone ─> replace
//!                              │ error                 │ error
//!                              └────── record unchanged ┘
//! ```
//!
//! Storage is written before the in-memory record is replaced, so a record
//! observed through the registry has always been persisted.
//!
//! New records reserve their thread in the index first, are persisted with
//! no lock held, and are only then published by id. A second insert on the
//! same thread sees the reservation and fails, which makes "one record per
//! thread" hold across concurrent local calls too. A failed write releases
//! the reservation.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use didcomm_core::{
    ConnectionRecord, CredentialExchange, PresentationExchange, Storage, StorageError, Timestamp,
};
use didcomm_proto::{AgentId, ConnectionId, ExchangeId, ThreadId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::DispatchError;

/// Shared handle to one connection record
pub type ConnectionHandle = Arc<Mutex<ConnectionRecord>>;

/// Shared handle to one credential exchange record
pub type ExchangeHandle = Arc<Mutex<CredentialExchange>>;

/// Shared handle to one presentation record
pub type PresentationHandle = Arc<Mutex<PresentationExchange>>;

#[derive(Default)]
struct ConnectionIndex {
    by_id: HashMap<ConnectionId, ConnectionHandle>,
    by_thread: HashMap<ThreadId, ConnectionId>,
    by_peer: HashMap<AgentId, ConnectionId>,
}

/// All connection records of an agent
pub struct ConnectionRegistry {
    index: RwLock<ConnectionIndex>,
    storage: Arc<dyn Storage>,
}

impl ConnectionRegistry {
    /// Load every stored connection
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let mut index = ConnectionIndex::default();
        let records = storage.load_connections()?;
        debug!(count = records.len(), "loaded connections");

        for record in records {
            Self::index_record(&mut index, &record);
            index.by_id.insert(record.id(), Arc::new(Mutex::new(record)));
        }

        Ok(Self { index: RwLock::new(index), storage })
    }

    fn index_record(index: &mut ConnectionIndex, record: &ConnectionRecord) {
        index.by_thread.insert(record.thread_id().clone(), record.id());
        if let (Some(peer), true) = (record.peer_agent(), record.is_completed()) {
            index.by_peer.insert(peer.clone(), record.id());
        }
    }

    /// Persist and index a new record
    ///
    /// # Errors
    /// `InvalidTransition` if the thread already belongs to a connection,
    /// `Storage` if the record could not be written
    pub fn insert(&self, record: ConnectionRecord) -> Result<ConnectionHandle, DispatchError> {
        let id = record.id();
        let thread_id = record.thread_id().clone();
        {
            let mut index = self.write();
            if index.by_thread.contains_key(&thread_id) {
                return Err(DispatchError::InvalidTransition(format!(
                    "thread {thread_id} already belongs to a connection"
                )));
            }
            index.by_thread.insert(thread_id.clone(), id);
        }

        if let Err(e) = self.storage.save_connection(&record) {
            let mut index = self.write();
            if index.by_thread.get(&thread_id) == Some(&id) {
                index.by_thread.remove(&thread_id);
            }
            return Err(e.into());
        }

        let mut index = self.write();
        Self::index_record(&mut index, &record);
        let handle = Arc::new(Mutex::new(record));
        index.by_id.insert(id, handle.clone());
        Ok(handle)
    }

    /// Persist `next` and make it the current version of `current`
    pub fn commit(
        &self,
        current: &mut ConnectionRecord,
        next: ConnectionRecord,
    ) -> Result<(), StorageError> {
        self.storage.save_connection(&next)?;
        Self::index_record(&mut self.write(), &next);
        *current = next;
        Ok(())
    }

    /// Record by id
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.read().by_id.get(&id).cloned()
    }

    /// Record owning a connection-protocol thread
    pub fn by_thread(&self, thread_id: &ThreadId) -> Option<ConnectionHandle> {
        let index = self.read();
        index.by_thread.get(thread_id).and_then(|id| index.by_id.get(id)).cloned()
    }

    /// Most recently completed connection with `peer`
    pub fn by_peer(&self, peer: &AgentId) -> Option<ConnectionHandle> {
        let index = self.read();
        index.by_peer.get(peer).and_then(|id| index.by_id.get(id)).cloned()
    }

    /// Every record handle
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.read().by_id.values().cloned().collect()
    }

    /// Snapshot of every record
    pub async fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records = Vec::new();
        for handle in self.handles() {
            records.push(handle.lock().await.clone());
        }
        records.sort_by_key(ConnectionRecord::created_at);
        records
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectionIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectionIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A record that owns exactly one thread on a connection
pub trait ThreadRecord: Clone + Send + 'static {
    /// Record kind, for logs
    const KIND: &'static str;

    /// Record id
    fn id(&self) -> ExchangeId;

    /// Thread the record owns
    fn thread_id(&self) -> &ThreadId;

    /// Creation time, for ordering snapshots
    fn created_at(&self) -> Timestamp;

    /// Insert or replace the record in `storage`
    fn save(&self, storage: &dyn Storage) -> Result<(), StorageError>;

    /// Every record of this kind in `storage`
    fn load_all(storage: &dyn Storage) -> Result<Vec<Self>, StorageError>;
}

impl ThreadRecord for CredentialExchange {
    const KIND: &'static str = "exchanges";

    fn id(&self) -> ExchangeId {
        CredentialExchange::id(self)
    }

    fn thread_id(&self) -> &ThreadId {
        CredentialExchange::thread_id(self)
    }

    fn created_at(&self) -> Timestamp {
        CredentialExchange::created_at(self)
    }

    fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        storage.save_exchange(self)
    }

    fn load_all(storage: &dyn Storage) -> Result<Vec<Self>, StorageError> {
        storage.load_exchanges()
    }
}

impl ThreadRecord for PresentationExchange {
    const KIND: &'static str = "presentations";

    fn id(&self) -> ExchangeId {
        PresentationExchange::id(self)
    }

    fn thread_id(&self) -> &ThreadId {
        PresentationExchange::thread_id(self)
    }

    fn created_at(&self) -> Timestamp {
        PresentationExchange::created_at(self)
    }

    fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        storage.save_presentation(self)
    }

    fn load_all(storage: &dyn Storage) -> Result<Vec<Self>, StorageError> {
        storage.load_presentations()
    }
}

struct ThreadIndex<R> {
    by_id: HashMap<ExchangeId, Arc<Mutex<R>>>,
    by_thread: HashMap<ThreadId, ExchangeId>,
}

impl<R> Default for ThreadIndex<R> {
    fn default() -> Self {
        Self { by_id: HashMap::new(), by_thread: HashMap::new() }
    }
}

/// Records that each own one thread, indexed by id and by thread
pub struct ThreadRegistry<R: ThreadRecord> {
    index: RwLock<ThreadIndex<R>>,
    storage: Arc<dyn Storage>,
}

/// All credential exchange records of an agent
pub type ExchangeRegistry = ThreadRegistry<CredentialExchange>;

/// All presentation records of an agent
pub type PresentationRegistry = ThreadRegistry<PresentationExchange>;

impl<R: ThreadRecord> ThreadRegistry<R> {
    /// Load every stored record
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let mut index = ThreadIndex::default();
        let records = R::load_all(storage.as_ref())?;
        debug!(count = records.len(), kind = R::KIND, "loaded records");

        for record in records {
            index.by_thread.insert(record.thread_id().clone(), record.id());
            index.by_id.insert(record.id(), Arc::new(Mutex::new(record)));
        }

        Ok(Self { index: RwLock::new(index), storage })
    }

    /// Persist and index a new record
    ///
    /// # Errors
    /// `ThreadInUse` if another record already owns the thread, `Storage`
    /// if the record could not be written
    pub fn insert(&self, record: R) -> Result<Arc<Mutex<R>>, DispatchError> {
        let thread_id = record.thread_id().clone();
        let id = record.id();
        {
            let mut index = self.write();
            if index.by_thread.contains_key(&thread_id) {
                return Err(DispatchError::ThreadInUse(thread_id));
            }
            index.by_thread.insert(thread_id.clone(), id);
        }

        if let Err(e) = record.save(self.storage.as_ref()) {
            let mut index = self.write();
            if index.by_thread.get(&thread_id) == Some(&id) {
                index.by_thread.remove(&thread_id);
            }
            return Err(e.into());
        }

        let handle = Arc::new(Mutex::new(record));
        self.write().by_id.insert(id, handle.clone());
        Ok(handle)
    }

    /// Persist `next` and make it the current version of `current`
    pub fn commit(&self, current: &mut R, next: R) -> Result<(), StorageError> {
        next.save(self.storage.as_ref())?;
        *current = next;
        Ok(())
    }

    /// Record by id
    pub fn get(&self, id: ExchangeId) -> Option<Arc<Mutex<R>>> {
        self.read().by_id.get(&id).cloned()
    }

    /// Record owning a thread
    pub fn by_thread(&self, thread_id: &ThreadId) -> Option<Arc<Mutex<R>>> {
        let index = self.read();
        index.by_thread.get(thread_id).and_then(|id| index.by_id.get(id)).cloned()
    }

    /// Every record handle
    pub fn handles(&self) -> Vec<Arc<Mutex<R>>> {
        self.read().by_id.values().cloned().collect()
    }

    /// Snapshot of every record, oldest first
    pub async fn snapshot(&self) -> Vec<R> {
        let mut records = Vec::new();
        for handle in self.handles() {
            records.push(handle.lock().await.clone());
        }
        records.sort_by_key(|r| r.created_at());
        records
    }

    fn read(&self) -> RwLockReadGuard<'_, ThreadIndex<R>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ThreadIndex<R>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}
