//! Interfaces of the local store, as far as the import needs them.

use sd_changeset::{ChangeSet, LocalId, LocalKey, PartitionId, Values};

use std::collections::HashMap;

use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("query failed: {0}")]
	Query(String),
	#[error("transaction failed <id='{id}'>: {reason}")]
	Transaction { id: Uuid, reason: String },
	#[error("transaction was not opened by this store <id='{0}'>")]
	ForeignTransaction(Uuid),
	#[error(transparent)]
	Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A type of the local model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalType {
	pub key: LocalKey,
	pub name: String,
	/// Table instances of this type are stored in.
	pub table: String,
	/// Keys of the attribute definitions of this type, by local attribute name.
	pub attributes: HashMap<String, LocalKey>,
}

impl LocalType {
	#[must_use]
	pub fn attribute(&self, name: &str) -> Option<&LocalKey> {
		self.attributes.get(name)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject {
	pub key: LocalKey,
	pub values: Values,
}

#[async_trait]
pub trait Store: Send + Sync {
	/// Loads all types with the given keys in one round trip. Unknown keys are left out.
	async fn load_types(&self, keys: &[LocalKey]) -> Result<Vec<LocalType>, StoreError>;

	/// Finds all objects of `table` in `partition` whose `attribute` has one of `values`.
	async fn search_by_attribute(
		&self,
		table: &str,
		partition: PartitionId,
		attribute: &str,
		values: &[String],
	) -> Result<Vec<LocalObject>, StoreError>;

	/// Allocates a fresh id for a new object of `table` in `partition`.
	fn allocate_id(&self, table: &str, partition: PartitionId) -> LocalId;

	async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

#[async_trait]
pub trait Transaction: Downcast + Send {
	fn id(&self) -> Uuid;

	async fn apply(&mut self, changeset: &ChangeSet) -> Result<(), StoreError>;

	async fn commit(self: Box<Self>) -> Result<(), StoreError>;

	async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

impl_downcast!(Transaction);

/// Durable key/value properties, written inside a transaction of the local store.
#[async_trait]
pub trait PropertyStore: Send + Sync {
	async fn set_property(
		&self,
		tx: &mut dyn Transaction,
		scope: &str,
		key: &str,
		value: &str,
	) -> Result<(), StoreError>;

	async fn property(&self, scope: &str, key: &str) -> Result<Option<String>, StoreError>;
}
