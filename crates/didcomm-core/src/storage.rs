//! Storage abstraction for durable agent state.
//!
//! Records must survive restarts: a connection that completed yesterday is
//! still usable today, and an exchange parked in `Offered` waits for a local
//! decision across process lifetimes. The runtime writes a record through to
//! storage every time a transition commits and reloads everything on startup.
//!
//! Records are encoded as CBOR. Writes are upserts keyed by record id, so
//! re-saving a record after a failed send is harmless.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use didcomm_proto::{ConnectionId, ExchangeId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    connection::ConnectionRecord, env::Timestamp, error::StorageError,
    exchange::CredentialExchange, presentation::PresentationExchange,
};

/// Basic message received over a completed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Connection the message arrived on
    pub connection_id: ConnectionId,
    /// Message text
    pub content: String,
    /// Sender-side timestamp, as sent
    pub sent_time: Option<String>,
    /// Local receive time
    pub received_at: Timestamp,
}

/// Durable record storage.
///
/// Implementations must be thread-safe; the runtime calls them from several
/// worker lanes at once, always for distinct records.
pub trait Storage: Send + Sync + 'static {
    /// Insert or replace a connection record
    fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StorageError>;

    /// Every stored connection record
    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StorageError>;

    /// Insert or replace a credential exchange record
    fn save_exchange(&self, record: &CredentialExchange) -> Result<(), StorageError>;

    /// Every stored credential exchange record
    fn load_exchanges(&self) -> Result<Vec<CredentialExchange>, StorageError>;

    /// Insert or replace a presentation record
    fn save_presentation(&self, record: &PresentationExchange) -> Result<(), StorageError>;

    /// Every stored presentation record
    fn load_presentations(&self) -> Result<Vec<PresentationExchange>, StorageError>;

    /// Append a received basic message
    fn append_message(&self, message: &StoredMessage) -> Result<(), StorageError>;

    /// Basic messages received on `connection_id`, oldest first
    fn messages(&self, connection_id: ConnectionId) -> Result<Vec<StoredMessage>, StorageError>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StorageError> {
        (**self).save_connection(record)
    }

    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StorageError> {
        (**self).load_connections()
    }

    fn save_exchange(&self, record: &CredentialExchange) -> Result<(), StorageError> {
        (**self).save_exchange(record)
    }

    fn load_exchanges(&self) -> Result<Vec<CredentialExchange>, StorageError> {
        (**self).load_exchanges()
    }

    fn save_presentation(&self, record: &PresentationExchange) -> Result<(), StorageError> {
        (**self).save_presentation(record)
    }

    fn load_presentations(&self) -> Result<Vec<PresentationExchange>, StorageError> {
        (**self).load_presentations()
    }

    fn append_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        (**self).append_message(message)
    }

    fn messages(&self, connection_id: ConnectionId) -> Result<Vec<StoredMessage>, StorageError> {
        (**self).messages(connection_id)
    }
}

/// Encode a value as CBOR
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| StorageError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Decode(e.to_string()))
}

#[derive(Default)]
struct Tables {
    connections: BTreeMap<ConnectionId, Vec<u8>>,
    exchanges: BTreeMap<ExchangeId, Vec<u8>>,
    presentations: BTreeMap<ExchangeId, Vec<u8>>,
    messages: Vec<(ConnectionId, Vec<u8>)>,
}

/// In-memory storage for tests and ephemeral agents.
///
/// Holds encoded bytes rather than live records so it exercises the same
/// codec path as durable backends. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut tables = self.tables.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&mut tables)
    }
}

impl Storage for MemoryStorage {
    fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StorageError> {
        let bytes = encode(record)?;
        self.with_tables(|t| {
            t.connections.insert(record.id(), bytes);
            Ok(())
        })
    }

    fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StorageError> {
        self.with_tables(|t| t.connections.values().map(|b| decode(b)).collect())
    }

    fn save_exchange(&self, record: &CredentialExchange) -> Result<(), StorageError> {
        let bytes = encode(record)?;
        self.with_tables(|t| {
            t.exchanges.insert(record.id(), bytes);
            Ok(())
        })
    }

    fn load_exchanges(&self) -> Result<Vec<CredentialExchange>, StorageError> {
        self.with_tables(|t| t.exchanges.values().map(|b| decode(b)).collect())
    }

    fn save_presentation(&self, record: &PresentationExchange) -> Result<(), StorageError> {
        let bytes = encode(record)?;
        self.with_tables(|t| {
            t.presentations.insert(record.id(), bytes);
            Ok(())
        })
    }

    fn load_presentations(&self) -> Result<Vec<PresentationExchange>, StorageError> {
        self.with_tables(|t| t.presentations.values().map(|b| decode(b)).collect())
    }

    fn append_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let bytes = encode(message)?;
        self.with_tables(|t| {
            t.messages.push((message.connection_id, bytes));
            Ok(())
        })
    }

    fn messages(&self, connection_id: ConnectionId) -> Result<Vec<StoredMessage>, StorageError> {
        self.with_tables(|t| {
            t.messages
                .iter()
                .filter(|(id, _)| *id == connection_id)
                .map(|(_, b)| decode(b))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use didcomm_proto::{AgentId, ThreadId, payloads::ConnectionRequest};

    use super::*;

    fn t(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn connection_save_is_upsert() {
        let storage = MemoryStorage::new();
        let mut record =
            ConnectionRecord::new_invitation(ConnectionId::generate(), ThreadId::new("inv"), None, t(0));
        storage.save_connection(&record).unwrap();

        let request =
            ConnectionRequest { label: "bob".into(), did: "did:peer:bob".parse().unwrap() };
        record.receive_request(&AgentId::new("bob"), &request, t(1)).unwrap();
        storage.save_connection(&record).unwrap();

        let loaded = storage.load_connections().unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn clones_share_tables() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        let connection_id = ConnectionId::generate();

        storage
            .append_message(&StoredMessage {
                connection_id,
                content: "hello".into(),
                sent_time: None,
                received_at: t(5),
            })
            .unwrap();

        let messages = other.messages(connection_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
        assert!(other.messages(ConnectionId::generate()).unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: Result<ConnectionRecord, _> = decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(StorageError::Decode(_))));
    }
}
