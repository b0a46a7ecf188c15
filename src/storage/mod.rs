pub mod key;
pub mod memory;

pub use key::{EntityKey, PathElement, TargetKey};

use crate::error::CounterError;
use crate::value::{Entity, Value};
use std::future::Future;
use std::sync::Arc;

/// An entity as the store holds it: key, fields, and the field names kept
/// out of secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntity {
    pub key: EntityKey,
    pub data: Entity,
    pub exclude_from_indexes: Vec<String>,
}

impl StoredEntity {
    pub fn new(key: EntityKey, data: Entity) -> Self {
        Self {
            key,
            data,
            exclude_from_indexes: Vec::new(),
        }
    }

    pub fn excluding(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude_from_indexes = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Equality-filtered scan over one kind, optionally projected onto a set of
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: String,
    pub filters: Vec<(String, Value)>,
    pub projection: Vec<String>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filters: Vec::new(),
            projection: Vec::new(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn select(mut self, fields: &[&str]) -> Self {
        self.projection = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn matches(&self, entity: &StoredEntity) -> bool {
        entity.key.kind() == self.kind
            && self
                .filters
                .iter()
                .all(|(field, value)| entity.data.get(field) == Some(value))
    }
}

/// One optimistic transaction. Handles are cheap clones of the same
/// transaction so a unit of work can own one while its runner commits
/// through another.
///
/// Reads record what they observed; `commit` fails with
/// [`CounterError::Conflict`] when another transaction changed any of it.
pub trait Transaction: Clone + Send + Sync + 'static {
    fn begin(&self) -> impl Future<Output = Result<(), CounterError>> + Send;

    fn get(
        &self,
        key: &EntityKey,
    ) -> impl Future<Output = Result<Option<StoredEntity>, CounterError>> + Send;

    /// Stages a write; nothing is visible until `commit`.
    fn upsert(&self, entity: StoredEntity) -> Result<(), CounterError>;

    fn commit(&self) -> impl Future<Output = Result<(), CounterError>> + Send;

    fn rollback(&self) -> impl Future<Output = Result<(), CounterError>> + Send;
}

pub trait Datastore: Send + Sync {
    type Transaction: Transaction;

    fn transaction(&self) -> Self::Transaction;

    fn run_query(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<StoredEntity>, CounterError>> + Send;
}

impl<D: Datastore> Datastore for Arc<D> {
    type Transaction = D::Transaction;

    fn transaction(&self) -> Self::Transaction {
        (**self).transaction()
    }

    fn run_query(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<StoredEntity>, CounterError>> + Send {
        (**self).run_query(query)
    }
}
