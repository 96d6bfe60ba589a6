use std::sync::Arc;

use tracing::{error, instrument, trace};

use super::{
	mapping::CheckpointConfig,
	store::{PropertyStore, Store, Transaction},
	Error, Result,
};

/// Records the last revision that was completely imported.
pub struct CheckpointWriter {
	store: Arc<dyn Store>,
	properties: Arc<dyn PropertyStore>,
	scope: String,
	key: String,
}

impl CheckpointWriter {
	#[must_use]
	pub fn new(
		store: Arc<dyn Store>,
		properties: Arc<dyn PropertyStore>,
		config: &CheckpointConfig,
	) -> Self {
		Self {
			store,
			properties,
			scope: config.scope.clone(),
			key: config.key.clone(),
		}
	}

	pub async fn last_processed_revision(&self) -> Result<Option<i64>> {
		let Some(value) = self.properties.property(&self.scope, &self.key).await? else {
			return Ok(None);
		};

		value
			.trim()
			.parse()
			.map(Some)
			.map_err(|source| Error::CorruptedCheckpoint {
				scope: self.scope.clone(),
				key: self.key.clone(),
				value,
				source,
			})
	}

	/// Records `revision` inside `tx`, or in a transaction of its own when there is none.
	#[instrument(skip(self, tx), fields(dedicated = tx.is_none()), err)]
	pub async fn record_processed(
		&self,
		revision: i64,
		tx: Option<&mut dyn Transaction>,
	) -> Result<()> {
		if let Some(tx) = tx {
			return self.write(tx, revision).await;
		}

		let mut tx = self
			.store
			.begin()
			.await
			.map_err(|source| Error::Checkpoint { revision, source })?;

		if let Err(e) = self.write(tx.as_mut(), revision).await {
			if let Err(rollback_error) = tx.rollback().await {
				error!(?rollback_error, "Failed to rollback checkpoint transaction;");
			}

			return Err(e);
		}

		tx.commit()
			.await
			.map_err(|source| Error::Checkpoint { revision, source })
	}

	async fn write(&self, tx: &mut dyn Transaction, revision: i64) -> Result<()> {
		trace!(tx_id = %tx.id(), "Writing checkpoint;");

		self.properties
			.set_property(tx, &self.scope, &self.key, &revision.to_string())
			.await
			.map_err(|source| Error::Checkpoint { revision, source })
	}
}
