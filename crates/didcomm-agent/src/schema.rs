//! Schema registry collaborator.
//!
//! Stands in for the ledger: read-only resolution of a schema id to the
//! attribute names a credential of that schema must carry.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use didcomm_proto::payloads::Attributes;

use crate::error::SchemaError;

/// Credential schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// `<name>:<version>`
    pub id: String,
    /// Schema name
    pub name: String,
    /// Schema version
    pub version: String,
    /// Attribute names every credential must carry
    pub attributes: BTreeSet<String>,
}

impl Schema {
    /// New schema, its id derived from name and version
    pub fn new<I, S>(name: &str, version: &str, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: format!("{name}:{version}"),
            name: name.to_string(),
            version: version.to_string(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Attribute values must cover the schema exactly
    pub fn validate(&self, values: &Attributes) -> Result<(), SchemaError> {
        if let Some(missing) = self.attributes.iter().find(|name| !values.contains_key(*name)) {
            return Err(SchemaError::MissingAttribute {
                schema_id: self.id.clone(),
                attribute: missing.clone(),
            });
        }
        if let Some(extra) = values.keys().find(|name| !self.attributes.contains(*name)) {
            return Err(SchemaError::UnexpectedAttribute {
                schema_id: self.id.clone(),
                attribute: extra.clone(),
            });
        }
        Ok(())
    }

    /// Every requested name must be a schema attribute
    pub fn require(&self, names: &BTreeSet<String>) -> Result<(), SchemaError> {
        match names.iter().find(|name| !self.attributes.contains(*name)) {
            Some(unknown) => Err(SchemaError::UnexpectedAttribute {
                schema_id: self.id.clone(),
                attribute: unknown.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Read-only schema lookup
#[async_trait]
pub trait SchemaRegistry: Send + Sync + 'static {
    /// Resolve a schema by id
    async fn resolve_schema(&self, schema_id: &str) -> Result<Schema, SchemaError>;
}

/// Schemas held in memory, published locally
#[derive(Debug, Default)]
pub struct MemorySchemaRegistry {
    schemas: RwLock<HashMap<String, Schema>>,
}

impl MemorySchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a schema resolvable, replacing any schema with the same id
    pub fn publish(&self, schema: Schema) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.id.clone(), schema);
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn resolve_schema(&self, schema_id: &str) -> Result<Schema, SchemaError> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schema_id)
            .cloned()
            .ok_or_else(|| SchemaError::NotFound(schema_id.to_string()))
    }
}
