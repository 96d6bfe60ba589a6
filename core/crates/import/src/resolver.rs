use sd_changeset::{
	ChangeSet, EventRef, ExternalReference, LocalKey, PartitionId, Value, META_ATTRIBUTE,
};

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	mem,
};

use futures_concurrency::future::TryJoin;
use tracing::{debug, error, instrument, trace, warn};

use super::{
	mapping::Mapping,
	pending::{ObjectAction, PendingResolutions, TypeAction},
	store::{LocalObject, LocalType, Store},
	Result,
};

/// Summary of the resolution of one changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
	/// Number of searches run against the local store.
	pub searches: usize,
	/// References found in the local store.
	pub resolved: usize,
	/// References to objects created by the same changeset.
	pub resolved_in_batch: usize,
	/// Local types that couldn't be loaded.
	pub orphaned_types: Vec<LocalKey>,
	/// References that couldn't be resolved, ordered.
	pub unresolved: Vec<ExternalReference>,
	/// Events dropped while rewriting, e.g. because their type is not imported.
	pub skipped_events: usize,
	/// Events dropped while resolving.
	pub dropped_events: usize,
	/// Attributes dropped because their value couldn't be resolved.
	pub dropped_attributes: usize,
}

struct Search {
	table: String,
	partition: PartitionId,
	/// External ids in search order.
	external_ids: Vec<String>,
	/// Reference each searched external id was made of.
	references: HashMap<String, ExternalReference>,
}

impl Search {
	fn new(table: &str, partition: PartitionId, chunk: &[ExternalReference]) -> Self {
		let external_ids = chunk.iter().map(ToString::to_string).collect::<Vec<_>>();

		Self {
			table: table.to_string(),
			partition,
			references: external_ids.iter().cloned().zip(chunk.iter().cloned()).collect(),
			external_ids,
		}
	}
}

struct Resolution<'a> {
	store: &'a dyn Store,
	mapping: &'a dyn Mapping,
	changeset: &'a mut ChangeSet,
	pending: PendingResolutions,
	dropped: HashSet<EventRef>,
	unresolved: Vec<(ExternalReference, ObjectAction)>,
	report: ResolutionReport,
}

/// Resolves everything collected while rewriting `changeset` and removes what can't be imported.
///
/// Afterwards `changeset` only holds local identities.
#[instrument(
	skip_all,
	fields(revision = changeset.revision, events = changeset.len()),
	err
)]
pub async fn resolve_all(
	store: &dyn Store,
	mapping: &dyn Mapping,
	pending: PendingResolutions,
	skipped: HashSet<EventRef>,
	changeset: &mut ChangeSet,
) -> Result<ResolutionReport> {
	let report = ResolutionReport {
		skipped_events: skipped.len(),
		..Default::default()
	};

	let mut resolution = Resolution {
		store,
		mapping,
		changeset,
		pending,
		dropped: skipped,
		unresolved: Vec::new(),
		report,
	};

	if resolution.pending.is_empty() {
		trace!("Nothing to resolve;");
	} else {
		resolution.resolve_types().await?;
		resolution.resolve_objects().await?;
		resolution.reconcile();
	}

	Ok(resolution.finish())
}

impl Resolution<'_> {
	async fn resolve_types(&mut self) -> Result<()> {
		if self.pending.types.is_empty() {
			return Ok(());
		}

		let keys = self.pending.types.keys().cloned().collect::<Vec<_>>();

		for local_type in self.store.load_types(&keys).await? {
			let Some(actions) = self.pending.types.remove(&local_type.key) else {
				continue;
			};

			trace!(local_type = %local_type.name, actions = actions.len(), "Loaded type;");

			for action in actions {
				self.apply_type_action(&local_type, action);
			}
		}

		if self.pending.types.is_empty() {
			return Ok(());
		}

		let mut orphaned = Vec::with_capacity(self.pending.types.len());

		for (type_key, actions) in mem::take(&mut self.pending.types) {
			orphaned.push(type_key);

			for action in actions {
				match action {
					TypeAction::AssignNewId { event, .. }
					| TypeAction::SetRelationAttribute { event, .. } => {
						self.dropped.insert(event);
					}
					TypeAction::ResolveObject { reference, then } => {
						self.unresolved.push((reference, then));
					}
					TypeAction::SetExternalId { .. } => {}
				}
			}
		}

		orphaned.sort();
		error!(
			types = %orphaned.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
			"Unable to resolve local types;"
		);
		self.report.orphaned_types = orphaned;

		Ok(())
	}

	fn apply_type_action(&mut self, local_type: &LocalType, action: TypeAction) {
		let table = local_type.table.as_str();

		match action {
			TypeAction::AssignNewId { event, reference } => {
				let Some(item) = self.changeset.event_mut(event) else {
					return;
				};

				let key = LocalKey::new(
					table,
					item.partition,
					self.store.allocate_id(table, item.partition),
				);

				item.object_id = Some(key.clone());
				item.object_type = table.to_string();
				item.values.insert(
					self.mapping.external_id_attribute(table).to_string(),
					Value::String(reference.to_string()),
				);

				self.pending.object_created(reference, key);
			}

			TypeAction::ResolveObject { reference, then } => {
				self.pending.on_object(table, reference, then);
			}

			TypeAction::SetExternalId { event, reference } => {
				if let Some(item) = self.changeset.event_mut(event) {
					item.values.insert(
						self.mapping.external_id_attribute(table).to_string(),
						Value::String(reference.to_string()),
					);
				}
			}

			TypeAction::SetRelationAttribute {
				event,
				slot,
				attribute,
			} => {
				let Some(definition) = local_type.attribute(&attribute) else {
					error!(
						local_type = %local_type.name,
						%attribute,
						"Association of an attribute the local type doesn't have, dropping it;"
					);
					self.dropped.insert(event);
					return;
				};

				if let Some(values) = self
					.changeset
					.event_mut(event)
					.and_then(|item| item.values_mut(slot))
				{
					values.insert(META_ATTRIBUTE.to_string(), Value::Key(definition.clone()));
				}
			}
		}
	}

	async fn resolve_objects(&mut self) -> Result<()> {
		let mut objects = mem::take(&mut self.pending.objects);
		let created = mem::take(&mut self.pending.created);

		let searches = objects
			.iter()
			.flat_map(|(table, by_reference)| {
				let mut references = by_reference
					.keys()
					.filter(|reference| !created.contains_key(*reference))
					.cloned()
					.collect::<Vec<_>>();

				// by partition first, that's how the store is searched
				references.sort();

				references
					.chunk_by(|a, b| a.partition == b.partition)
					.map(|chunk| Search::new(table, chunk[0].partition, chunk))
					.collect::<Vec<_>>()
			})
			.collect::<Vec<_>>();

		self.report.searches = searches.len();

		let found = if searches.is_empty() {
			Vec::new()
		} else {
			searches
				.iter()
				.map(|search| self.search(search))
				.collect::<Vec<_>>()
				.try_join()
				.await?
		};

		let mapping = self.mapping;
		for (search, local_objects) in searches.iter().zip(found) {
			let Some(by_reference) = objects.get_mut(&search.table) else {
				continue;
			};

			let attribute = mapping.external_id_attribute(&search.table);

			for object in local_objects {
				// matched by the searched value, the text form can't always be parsed back
				let Some(reference) = object
					.values
					.get(attribute)
					.and_then(Value::as_str)
					.and_then(|external_id| search.references.get(external_id))
				else {
					warn!(key = %object.key, %attribute, "Found object with an external id that wasn't searched for;");
					continue;
				};

				let Some(actions) = by_reference.remove(reference) else {
					continue;
				};

				self.report.resolved += 1;
				for action in actions {
					self.apply_object_action(&object.key, action);
				}
			}
		}

		for (reference, actions) in objects.into_values().flatten() {
			if let Some(key) = created.get(&reference) {
				self.report.resolved_in_batch += 1;
				for action in actions {
					self.apply_object_action(key, action);
				}
			} else {
				self.unresolved
					.extend(actions.into_iter().map(|action| (reference.clone(), action)));
			}
		}

		Ok(())
	}

	async fn search(&self, search: &Search) -> Result<Vec<LocalObject>> {
		trace!(
			table = %search.table,
			partition = search.partition,
			references = search.external_ids.len(),
			"Searching objects by external id;"
		);

		self.store
			.search_by_attribute(
				&search.table,
				search.partition,
				self.mapping.external_id_attribute(&search.table),
				&search.external_ids,
			)
			.await
			.map_err(Into::into)
	}

	fn apply_object_action(&mut self, key: &LocalKey, action: ObjectAction) {
		match action {
			ObjectAction::SetObjectId(event) => {
				if let Some(item) = self.changeset.event_mut(event) {
					item.object_id = Some(key.clone());
					item.object_type.clone_from(&key.table);
				}
			}

			ObjectAction::SetAttribute {
				event,
				slot,
				attribute,
			} => {
				if let Some(values) = self
					.changeset
					.event_mut(event)
					.and_then(|item| item.values_mut(slot))
				{
					values.insert(attribute, Value::Key(key.clone()));
				}
			}
		}
	}

	/// Removes what depends on references that couldn't be resolved.
	fn reconcile(&mut self) {
		let mut unresolved = BTreeSet::new();

		for (reference, action) in mem::take(&mut self.unresolved) {
			unresolved.insert(reference);

			if self.dropped.contains(&action.event()) {
				continue;
			}

			match action {
				// changing an object that was never imported
				ObjectAction::SetObjectId(event) => {
					self.dropped.insert(event);
				}

				ObjectAction::SetAttribute {
					event,
					slot,
					attribute,
				} => {
					let Some(item) = self.changeset.event_mut(event) else {
						continue;
					};

					if self.mapping.is_association(&item.object_type) {
						// a link needs both of its ends
						self.dropped.insert(event);
					} else if let Some(values) = item.values_mut(slot) {
						values.remove(&attribute);
						self.report.dropped_attributes += 1;
					}
				}
			}
		}

		if !unresolved.is_empty() {
			error!(
				revision = self.changeset.revision,
				references = %unresolved.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
				"Some external references could not be resolved;"
			);
		}

		self.report.unresolved = unresolved.into_iter().collect();
	}

	fn finish(self) -> ResolutionReport {
		let Self {
			changeset,
			dropped,
			mut report,
			..
		} = self;

		report.dropped_events = dropped.len() - report.skipped_events;

		changeset.retain_events(&dropped);
		for event in changeset.events_mut() {
			event.strip_transient_attributes();
		}

		debug!(?report, "Resolved changeset;");

		report
	}
}
