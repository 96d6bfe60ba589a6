use sd_changeset::ChangeSet;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use super::{
	checkpoint::CheckpointWriter,
	mapping::ImportConfig,
	resolver::{self, ResolutionReport},
	rewriter::Rewriter,
	store::{PropertyStore, Store, Transaction},
	Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
	/// The rewritten changeset was applied to the local store.
	Applied {
		revision: i64,
		events: usize,
		report: ResolutionReport,
	},
	/// Nothing was left to apply, only the revision was recorded.
	Empty {
		revision: i64,
		report: ResolutionReport,
	},
	/// The revision was imported before.
	AlreadyProcessed { revision: i64 },
}

impl ImportOutcome {
	#[must_use]
	pub const fn revision(&self) -> i64 {
		match self {
			Self::Applied { revision, .. }
			| Self::Empty { revision, .. }
			| Self::AlreadyProcessed { revision } => *revision,
		}
	}
}

/// Imports changesets of the remote system into the local store, one at a time and in
/// revision order.
pub struct ImportPipeline {
	store: Arc<dyn Store>,
	config: Arc<ImportConfig>,
	checkpoint: CheckpointWriter,
	/// Also serializes imports, it's held for a whole changeset.
	last_revision: Mutex<Option<i64>>,
}

impl ImportPipeline {
	pub async fn new(
		store: Arc<dyn Store>,
		properties: Arc<dyn PropertyStore>,
		config: ImportConfig,
	) -> Result<Self> {
		let checkpoint = CheckpointWriter::new(Arc::clone(&store), properties, &config.checkpoint);
		let last_revision = checkpoint.last_processed_revision().await?;

		debug!(?last_revision, "Import pipeline ready;");

		Ok(Self {
			store,
			config: Arc::new(config),
			checkpoint,
			last_revision: Mutex::new(last_revision),
		})
	}

	#[must_use]
	pub fn config(&self) -> &ImportConfig {
		&self.config
	}

	pub async fn last_processed_revision(&self) -> Option<i64> {
		*self.last_revision.lock().await
	}

	/// Rewrites `changeset` to local names and identities without applying it.
	#[instrument(
		skip_all,
		fields(revision = changeset.revision, events = changeset.len()),
		err
	)]
	pub async fn rewrite(&self, changeset: ChangeSet) -> Result<(ChangeSet, ResolutionReport)> {
		let _guard = self.last_revision.lock().await;

		self.rewrite_changeset(changeset).await
	}

	/// Imports `changeset` and records its revision, both in one transaction.
	///
	/// Changesets that were imported before are ignored, so redelivered changesets do no harm.
	#[instrument(
		skip_all,
		fields(revision = changeset.revision, events = changeset.len()),
		err
	)]
	pub async fn process(&self, changeset: ChangeSet) -> Result<ImportOutcome> {
		let mut last_revision = self.last_revision.lock().await;
		let revision = changeset.revision;

		if last_revision.is_some_and(|last| revision <= last) {
			debug!(last_revision = ?*last_revision, "Skipping changeset, it was already imported;");
			return Ok(ImportOutcome::AlreadyProcessed { revision });
		}

		let (changeset, report) = self.rewrite_changeset(changeset).await?;

		let outcome = if changeset.is_empty() {
			debug!("Nothing left to import, only recording the revision;");
			self.checkpoint.record_processed(revision, None).await?;

			ImportOutcome::Empty { revision, report }
		} else {
			self.apply(&changeset).await?;

			ImportOutcome::Applied {
				revision,
				events: changeset.len(),
				report,
			}
		};

		*last_revision = Some(revision);

		Ok(outcome)
	}

	async fn rewrite_changeset(
		&self,
		mut changeset: ChangeSet,
	) -> Result<(ChangeSet, ResolutionReport)> {
		if changeset.len() > self.config.log_size_threshold {
			info!(
				revision = changeset.revision,
				events = changeset.len(),
				by_type = ?changeset.count_by_type(),
				"Importing large changeset;"
			);
		}

		let (pending, skipped) =
			Rewriter::new(self.config.as_ref(), self.store.as_ref()).rewrite(&mut changeset)?;

		let report = resolver::resolve_all(
			self.store.as_ref(),
			self.config.as_ref(),
			pending,
			skipped,
			&mut changeset,
		)
		.await?;

		Ok((changeset, report))
	}

	async fn apply(&self, changeset: &ChangeSet) -> Result<()> {
		let mut tx = self.store.begin().await?;

		if let Err(e) = self.apply_in(tx.as_mut(), changeset).await {
			if let Err(rollback_error) = tx.rollback().await {
				error!(?rollback_error, "Failed to rollback import transaction;");
			}

			return Err(e);
		}

		tx.commit().await.map_err(Into::into)
	}

	async fn apply_in(&self, tx: &mut dyn Transaction, changeset: &ChangeSet) -> Result<()> {
		tx.apply(changeset).await?;

		self.checkpoint
			.record_processed(changeset.revision, Some(tx))
			.await
	}
}
