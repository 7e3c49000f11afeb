//! Durable storage on redb.
//!
//! Four tables, all values CBOR-encoded with the same codec as
//! [`MemoryStorage`](didcomm_core::MemoryStorage):
//!
//! | table         | key                 | value              |
//! |---------------|---------------------|--------------------|
//! | `connections` | connection id       | `ConnectionRecord` |
//! | `exchanges`   | exchange id         | `CredentialExchange` |
//! | `presentations` | exchange id       | `PresentationExchange` |
//! | `messages`    | append sequence     | `StoredMessage`    |
//!
//! Every save is its own write transaction, so a record is durable by the
//! time the registry makes the new version visible.

use std::path::Path;

use didcomm_core::{
    ConnectionRecord, CredentialExchange, PresentationExchange, Storage, StorageError, StoredMessage,
    storage::{decode, encode},
};
use didcomm_proto::ConnectionId;
use redb::{Database, ReadableTable, TableDefinition, TableHandle, backends::InMemoryBackend};
use serde::de::DeserializeOwned;
use tracing::debug;

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const CONNECTIONS: RecordTable = TableDefinition::new("connections");
const EXCHANGES: RecordTable = TableDefinition::new("exchanges");
const PRESENTATIONS: RecordTable = TableDefinition::new("presentations");
const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

fn backend(err: impl Into<redb::Error>) -> StorageError {
    StorageError::Backend(err.into().to_string())
}

/// Record storage in a redb database
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    /// Open or create the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(backend)?;
        debug!(path = %path.display(), "opened record database");
        Self::init(db)
    }

    /// Database held in memory, lost on drop
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new()).map_err(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StorageError> {
        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(CONNECTIONS).map_err(backend)?;
        txn.open_table(EXCHANGES).map_err(backend)?;
        txn.open_table(PRESENTATIONS).map_err(backend)?;
        txn.open_table(MESSAGES).map_err(backend)?;
        txn.commit().map_err(backend)?;
        Ok(Self { db })
    }

    fn put(&self, table: RecordTable, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(table).map_err(backend)?;
            table.insert(key, bytes).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn load<T: DeserializeOwned>(&self, definition: RecordTable) -> Result<Vec<T>, StorageError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(definition).map_err(backend)?;

        let mut records = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            records.push(decode(value.value())?);
        }
        debug!(table = definition.name(), count = records.len(), "loaded");
        Ok(records)
    }
}

impl Storage for RedbStorage {
    fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StorageError> {
        self.put(CONNECTIONS, &record.id().to_string(), &encode(record)?)
    }

    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StorageError> {
        self.load(CONNECTIONS)
    }

    fn save_exchange(&self, record: &CredentialExchange) -> Result<(), StorageError> {
        self.put(EXCHANGES, &record.id().to_string(), &encode(record)?)
    }

    fn load_exchanges(&self) -> Result<Vec<CredentialExchange>, StorageError> {
        self.load(EXCHANGES)
    }

    fn save_presentation(&self, record: &PresentationExchange) -> Result<(), StorageError> {
        self.put(PRESENTATIONS, &record.id().to_string(), &encode(record)?)
    }

    fn load_presentations(&self) -> Result<Vec<PresentationExchange>, StorageError> {
        self.load(PRESENTATIONS)
    }

    fn append_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let bytes = encode(message)?;
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            let next = match table.last().map_err(backend)? {
                Some((seq, _)) => seq.value() + 1,
                None => 0,
            };
            table.insert(next, bytes.as_slice()).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn messages(&self, connection_id: ConnectionId) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(MESSAGES).map_err(backend)?;

        let mut messages = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            let message: StoredMessage = decode(value.value())?;
            if message.connection_id == connection_id {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}
