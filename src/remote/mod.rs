//! Boundary to the network-accessible, multi-tenant document store that holds
//! the durable copy of every visitor's data.

pub mod memory;

pub use memory::InMemoryGateway;

use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Fields = Map<String, Value>;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// One operation of a batched write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Upsert {
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl BatchOp {
    pub fn collection(&self) -> &str {
        match self {
            Self::Upsert { collection, .. } | Self::Delete { collection, .. } => collection,
        }
    }
}

/// Remote document store.
///
/// Any call may fail with [`crate::IdentityError::RemoteUnavailable`] or
/// [`crate::IdentityError::RemotePermissionDenied`]; callers never assume
/// availability.
#[async_trait]
pub trait RemoteDataGateway: Send + Sync {
    /// Creates or merges the document `collection/id`.
    async fn upsert(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Documents whose `field` equals `value`, at most `limit` of them.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Document>>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Applies every operation or none of them.
    async fn batch_write(&self, ops: Vec<BatchOp>) -> Result<()>;
}
