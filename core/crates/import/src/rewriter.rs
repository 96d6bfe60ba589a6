use sd_changeset::{
	ChangeSet, EventKind, EventRef, ExternalReference, ItemEvent, LocalKey, Value, ValueSlot,
	Values, DESTINATION_ATTRIBUTE, EXT_REFERENCE_ATTRIBUTE, META_ATTRIBUTE, PLAIN_IMPORT_MARKER,
	SOURCE_ATTRIBUTE, TYPE_ATTRIBUTE,
};

use std::{collections::HashSet, mem};

use tracing::{debug, error, info, trace, warn};

use super::{
	mapping::{qualified_attribute, Mapping},
	pending::{ObjectAction, PendingResolutions, TypeAction},
	store::Store,
	Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Apply,
	Skip,
}

/// Rewrites remote events to local names and collects what has to be resolved afterwards.
///
/// Events are only changed in place, skipped events are reported and removed later on, so
/// [`EventRef`]s stay valid until the resolution is done.
pub struct Rewriter<'a> {
	mapping: &'a dyn Mapping,
	store: &'a dyn Store,
	pending: PendingResolutions,
	skipped: HashSet<EventRef>,
}

impl<'a> Rewriter<'a> {
	pub fn new(mapping: &'a dyn Mapping, store: &'a dyn Store) -> Self {
		Self {
			mapping,
			store,
			pending: PendingResolutions::default(),
			skipped: HashSet::new(),
		}
	}

	pub fn rewrite(
		mut self,
		changeset: &mut ChangeSet,
	) -> Result<(PendingResolutions, HashSet<EventRef>)> {
		for kind in [EventKind::Create, EventKind::Update, EventKind::Delete] {
			for index in 0..changeset.list(kind).len() {
				let at = EventRef::new(kind, index);
				let Some(event) = changeset.event_mut(at) else {
					continue;
				};

				let registrations = self.pending.registrations();
				if self.rewrite_event(at, event)? == Decision::Skip {
					// most skips are decided before anything was registered
					if self.pending.registrations() != registrations {
						self.pending.forget_event(at);
					}
					self.skipped.insert(at);
				}
			}
		}

		Ok((self.pending, self.skipped))
	}

	fn rewrite_event(&mut self, at: EventRef, event: &mut ItemEvent) -> Result<Decision> {
		if event.is_plain_import() {
			trace!(object_type = %event.object_type, "Importing event as is;");
			return Ok(Decision::Apply);
		}

		let Some(reference) = event.external_reference().cloned() else {
			error!(
				object_type = %event.object_type,
				kind = ?event.kind,
				"Skipped event without external reference;"
			);
			return Ok(Decision::Skip);
		};

		match (event.kind, self.mapping.is_association(&event.object_type)) {
			(EventKind::Create, false) => self.create_object(at, event, reference),
			(EventKind::Create, true) => self.create_association(at, event, &reference),
			(EventKind::Update, false) => self.update_object(at, event, &reference),
			(EventKind::Update, true) => self.update_association(at, event, reference),
			(EventKind::Delete, false) => self.delete_object(at, event, &reference),
			(EventKind::Delete, true) => self.delete_association(at, event, reference),
		}
	}

	fn type_mapping(&self, event: &ItemEvent, remote_type: &str) -> Option<LocalKey> {
		let type_key = self.mapping.map_type(remote_type).cloned();

		if type_key.is_none() {
			info!(
				object_type = %event.object_type,
				%remote_type,
				"Skipped event, source type is not imported;"
			);
		}

		type_key
	}

	fn create_object(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: ExternalReference,
	) -> Result<Decision> {
		let Some(type_key) = self.type_mapping(event, &reference.remote_type) else {
			return Ok(Decision::Skip);
		};

		self.map_attributes(at, ValueSlot::New, &reference, &mut event.values)?;
		// last, attribute mapping must not touch it
		event
			.values
			.insert(TYPE_ATTRIBUTE.to_string(), Value::Key(type_key.clone()));

		self.pending
			.on_type(&type_key, TypeAction::AssignNewId { event: at, reference });

		Ok(Decision::Apply)
	}

	fn create_association(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: &ExternalReference,
	) -> Result<Decision> {
		// associations live in a fixed table, no need to wait for a type
		let id = self.store.allocate_id(&event.object_type, event.partition);
		event.object_id = Some(LocalKey::new(
			event.object_type.clone(),
			event.partition,
			id,
		));
		event.values.insert(
			self.mapping
				.external_id_attribute(&event.object_type)
				.to_string(),
			Value::String(reference.to_string()),
		);

		self.map_association(at, ValueSlot::New, &event.object_type, &mut event.values)
	}

	fn update_object(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: &ExternalReference,
	) -> Result<Decision> {
		let Some(type_key) = self.type_mapping(event, &reference.remote_type) else {
			return Ok(Decision::Skip);
		};

		self.pending.on_type(
			&type_key,
			TypeAction::ResolveObject {
				reference: reference.clone(),
				then: ObjectAction::SetObjectId(at),
			},
		);

		self.map_attributes(at, ValueSlot::New, reference, &mut event.values)?;
		event
			.values
			.insert(TYPE_ATTRIBUTE.to_string(), Value::Key(type_key.clone()));

		if let Some(old_values) = event.old_values.as_mut() {
			self.map_attributes(at, ValueSlot::Old, reference, old_values)?;
			old_values.insert(TYPE_ATTRIBUTE.to_string(), Value::Key(type_key));
		}

		Ok(Decision::Apply)
	}

	fn update_association(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: ExternalReference,
	) -> Result<Decision> {
		if self.map_association(at, ValueSlot::New, &event.object_type, &mut event.values)?
			== Decision::Skip
		{
			return Ok(Decision::Skip);
		}

		self.pending
			.on_object(&event.object_type, reference, ObjectAction::SetObjectId(at));

		match event.old_values.as_mut() {
			Some(old_values) => {
				self.map_association(at, ValueSlot::Old, &event.object_type, old_values)
			}
			None => Ok(Decision::Apply),
		}
	}

	fn delete_object(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: &ExternalReference,
	) -> Result<Decision> {
		let Some(type_key) = self.type_mapping(event, &reference.remote_type) else {
			return Ok(Decision::Skip);
		};

		self.pending.on_type(
			&type_key,
			TypeAction::ResolveObject {
				reference: reference.clone(),
				then: ObjectAction::SetObjectId(at),
			},
		);
		self.pending.on_type(
			&type_key,
			TypeAction::SetExternalId {
				event: at,
				reference: reference.clone(),
			},
		);

		self.map_attributes(at, ValueSlot::New, reference, &mut event.values)?;
		event
			.values
			.insert(TYPE_ATTRIBUTE.to_string(), Value::Key(type_key));

		Ok(Decision::Apply)
	}

	fn delete_association(
		&mut self,
		at: EventRef,
		event: &mut ItemEvent,
		reference: ExternalReference,
	) -> Result<Decision> {
		let decision =
			self.map_association(at, ValueSlot::New, &event.object_type, &mut event.values)?;

		if decision == Decision::Apply {
			self.pending
				.on_object(&event.object_type, reference, ObjectAction::SetObjectId(at));
		}

		Ok(decision)
	}

	/// Maps both ends and the relation attribute of an association.
	///
	/// The source is the owner of the relation, so it's never mapped itself. The destination
	/// is mapped as a value of the relation attribute of the source type.
	fn map_association(
		&mut self,
		at: EventRef,
		slot: ValueSlot,
		object_type: &str,
		values: &mut Values,
	) -> Result<Decision> {
		let Some(source) = values
			.get(SOURCE_ATTRIBUTE)
			.and_then(Value::as_ext_ref)
			.cloned()
		else {
			error!(%object_type, "Skipped association without external reference of its source;");
			return Ok(Decision::Skip);
		};

		let Some(source_type) = self.mapping.map_type(&source.remote_type).cloned() else {
			info!(
				%object_type,
				source_type = %source.remote_type,
				"Skipped association, type of its source is not imported;"
			);
			return Ok(Decision::Skip);
		};

		let Some(relation) = values
			.get(META_ATTRIBUTE)
			.and_then(Value::as_str)
			.map(str::to_string)
		else {
			error!(%object_type, %source, "Skipped association without relation attribute;");
			return Ok(Decision::Skip);
		};

		let Some(local_relation) = self
			.mapping
			.map_attribute(&qualified_attribute(&source.remote_type, &relation))
			.map(str::to_string)
		else {
			info!(
				%object_type,
				source_type = %source.remote_type,
				%relation,
				"Skipped association, relation attribute is not imported;"
			);
			return Ok(Decision::Skip);
		};

		let destination = values.remove(DESTINATION_ATTRIBUTE).unwrap_or_default();

		match self
			.mapping
			.map_value(&source.remote_type, &local_relation, destination)?
		{
			Some(Value::ExtRef(target)) => {
				let Some(target_type) = self.mapping.map_type(&target.remote_type).cloned() else {
					info!(
						%object_type,
						target_type = %target.remote_type,
						"Skipped association, type of its destination is not imported;"
					);
					return Ok(Decision::Skip);
				};

				self.pending.on_type(
					&target_type,
					TypeAction::ResolveObject {
						reference: target,
						then: ObjectAction::SetAttribute {
							event: at,
							slot,
							attribute: DESTINATION_ATTRIBUTE.to_string(),
						},
					},
				);
			}
			Some(key @ Value::Key(_)) => {
				values.insert(DESTINATION_ATTRIBUTE.to_string(), key);
			}
			other => {
				warn!(
					%object_type,
					%source,
					destination = ?other,
					"Skipped association, its destination is not an object;"
				);
				return Ok(Decision::Skip);
			}
		}

		values.remove(SOURCE_ATTRIBUTE);
		self.pending.on_type(
			&source_type,
			TypeAction::ResolveObject {
				reference: source,
				then: ObjectAction::SetAttribute {
					event: at,
					slot,
					attribute: SOURCE_ATTRIBUTE.to_string(),
				},
			},
		);
		self.pending.on_type(
			&source_type,
			TypeAction::SetRelationAttribute {
				event: at,
				slot,
				attribute: local_relation,
			},
		);

		Ok(Decision::Apply)
	}

	/// Renames the attributes of `owner` to their local names and maps their values.
	///
	/// Attributes without a local name are dropped. References to other objects are taken out
	/// and put back once resolved. Renamed attributes are inserted after all others have been
	/// looked at, so renames never chain.
	fn map_attributes(
		&mut self,
		at: EventRef,
		slot: ValueSlot,
		owner: &ExternalReference,
		values: &mut Values,
	) -> Result<()> {
		let owner_type = owner.remote_type.as_str();
		let mut renamed = Vec::new();

		for (name, value) in mem::take(values) {
			if name == EXT_REFERENCE_ATTRIBUTE || name == PLAIN_IMPORT_MARKER {
				values.insert(name, value);
				continue;
			}

			let Some(local_name) = self
				.mapping
				.map_attribute(&qualified_attribute(owner_type, &name))
				.map(str::to_string)
			else {
				trace!(%owner, attribute = %name, "Attribute is not imported;");
				continue;
			};

			let Some(mapped) = self
				.mapping
				.map_value(owner_type, &local_name, value.clone())?
			else {
				continue;
			};

			if let Value::ExtRef(target) = mapped {
				let Some(target_type) = self.mapping.map_type(&target.remote_type).cloned() else {
					debug!(
						%owner,
						attribute = %local_name,
						value = %target,
						"Skipped attribute, type of its value is not imported;"
					);
					continue;
				};

				self.pending.on_type(
					&target_type,
					TypeAction::ResolveObject {
						reference: target,
						then: ObjectAction::SetAttribute {
							event: at,
							slot,
							attribute: local_name,
						},
					},
				);
				continue;
			}

			if name == local_name && mapped == value {
				values.insert(name, value);
			} else {
				renamed.push((local_name, mapped));
			}
		}

		values.extend(renamed);

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use sd_changeset::{LocalId, PartitionId};

	use std::sync::atomic::{AtomicU64, Ordering};

	use async_trait::async_trait;

	use crate::{ImportConfig, LocalObject, LocalType, StoreError, Transaction};

	use super::*;

	#[derive(Default)]
	struct IdStore(AtomicU64);

	#[async_trait]
	impl Store for IdStore {
		async fn load_types(&self, _: &[LocalKey]) -> Result<Vec<LocalType>, StoreError> {
			Ok(vec![])
		}

		async fn search_by_attribute(
			&self,
			_: &str,
			_: PartitionId,
			_: &str,
			_: &[String],
		) -> Result<Vec<LocalObject>, StoreError> {
			Ok(vec![])
		}

		fn allocate_id(&self, _: &str, _: PartitionId) -> LocalId {
			LocalId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
		}

		async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
			Err(StoreError::Query("read only".to_string()))
		}
	}

	fn config() -> ImportConfig {
		ImportConfig::from_json(
			r#"{
				"type_mapping": {
					"crm:Person": { "table": "MetaElement", "partition": 1, "id": 1 },
					"crm:Company": { "table": "MetaElement", "partition": 1, "id": 2 }
				},
				"attribute_mapping": {
					"crm:Person#a": "b",
					"crm:Person#b": "c",
					"crm:Person#age": "age",
					"crm:Person#employer": "employer",
					"crm:Person#friend": "friend",
					"crm:Company#staff": "employees"
				},
				"association_types": ["hasWrapperAttValue"]
			}"#,
		)
		.unwrap()
	}

	fn person() -> LocalKey {
		LocalKey::new("MetaElement", 1, LocalId(1))
	}

	fn company() -> LocalKey {
		LocalKey::new("MetaElement", 1, LocalId(2))
	}

	fn reference(remote_type: &str, name: &str) -> ExternalReference {
		ExternalReference::new(remote_type, name, 1)
	}

	fn values<const N: usize>(entries: [(&str, Value); N]) -> Values {
		entries
			.into_iter()
			.map(|(name, value)| (name.to_string(), value))
			.collect()
	}

	fn rewrite(changeset: &mut ChangeSet) -> (PendingResolutions, HashSet<EventRef>) {
		let config = config();
		let store = IdStore::default();

		Rewriter::new(&config, &store).rewrite(changeset).unwrap()
	}

	#[test]
	fn renames_do_not_chain() {
		let p1 = reference("crm:Person", "P1");
		let mut changeset = ChangeSet::new(1).with(
			ItemEvent::create(
				"Person",
				1,
				values([
					("a", Value::Int(1)),
					("b", Value::Int(2)),
					("age", Value::Int(3)),
					("phone", "555".into()),
				]),
			)
			.with_external_reference(p1.clone()),
		);

		let (pending, skipped) = rewrite(&mut changeset);

		assert!(skipped.is_empty());
		assert_eq!(
			changeset.creations[0].values,
			values([
				(EXT_REFERENCE_ATTRIBUTE, p1.clone().into()),
				("age", Value::Int(3)),
				("b", Value::Int(1)),
				("c", Value::Int(2)),
				(TYPE_ATTRIBUTE, person().into()),
			])
		);
		assert_eq!(
			pending.types[&person()],
			vec![TypeAction::AssignNewId {
				event: EventRef::new(EventKind::Create, 0),
				reference: p1,
			}]
		);
	}

	#[test]
	fn identity_mapping_is_idempotent() {
		let mut changeset = ChangeSet::new(1).with(
			ItemEvent::update("Person", 1, values([("age", Value::Int(3))]), None)
				.with_external_reference(reference("crm:Person", "P1")),
		);

		rewrite(&mut changeset);
		let once = changeset.clone();
		rewrite(&mut changeset);

		assert_eq!(changeset, once);
	}

	#[test]
	fn defers_references_to_other_objects() {
		let c1 = reference("crm:Company", "C1");
		let mut changeset = ChangeSet::new(1).with(
			ItemEvent::update(
				"Person",
				1,
				values([
					("employer", c1.clone().into()),
					("friend", reference("crm:Pet", "X").into()),
				]),
				Some(values([("employer", reference("crm:Company", "C0").into())])),
			)
			.with_external_reference(reference("crm:Person", "P1")),
		);

		let (pending, _) = rewrite(&mut changeset);
		let update = &changeset.updates[0];

		assert!(!update.values.contains_key("employer"));
		assert!(!update.values.contains_key("friend"));
		assert_eq!(
			update.old_values.as_ref().unwrap().get(TYPE_ATTRIBUTE),
			Some(&Value::Key(person()))
		);

		let at = EventRef::new(EventKind::Update, 0);
		assert_eq!(
			pending.types[&company()],
			vec![
				TypeAction::ResolveObject {
					reference: c1,
					then: ObjectAction::SetAttribute {
						event: at,
						slot: ValueSlot::New,
						attribute: "employer".to_string(),
					},
				},
				TypeAction::ResolveObject {
					reference: reference("crm:Company", "C0"),
					then: ObjectAction::SetAttribute {
						event: at,
						slot: ValueSlot::Old,
						attribute: "employer".to_string(),
					},
				},
			]
		);
		assert_eq!(
			pending.types[&person()],
			vec![TypeAction::ResolveObject {
				reference: reference("crm:Person", "P1"),
				then: ObjectAction::SetObjectId(at),
			}]
		);
	}

	#[test]
	fn skips_unmapped_types_and_events_without_reference() {
		let mut changeset = ChangeSet::new(1)
			.with(
				ItemEvent::create("Pet", 1, Values::new())
					.with_external_reference(reference("crm:Pet", "X")),
			)
			.with(ItemEvent::delete("Person", 1, Values::new()))
			.with(
				ItemEvent::update("Person", 1, values([(PLAIN_IMPORT_MARKER, true.into())]), None),
			);

		let (pending, skipped) = rewrite(&mut changeset);

		assert!(pending.is_empty());
		assert_eq!(
			skipped,
			HashSet::from([
				EventRef::new(EventKind::Create, 0),
				EventRef::new(EventKind::Delete, 0),
			])
		);
	}

	#[test]
	fn unmapped_events_register_nothing() {
		let mut changeset = (0..100).fold(ChangeSet::new(1), |changeset, n| {
			changeset.with(
				ItemEvent::create("Pet", 1, Values::new())
					.with_external_reference(reference("crm:Pet", &format!("X{n}"))),
			)
		});
		changeset.push(
			ItemEvent::create("Person", 1, Values::new())
				.with_external_reference(reference("crm:Person", "P1")),
		);

		let (pending, skipped) = rewrite(&mut changeset);

		assert_eq!(skipped.len(), 100);
		assert_eq!(pending.registrations(), 1);
		assert_eq!(pending.types[&person()].len(), 1);
	}

	#[test]
	fn maps_association_ends() {
		let c1 = reference("crm:Company", "C1");
		let p1 = reference("crm:Person", "P1");
		let link = reference("crm:Employment", "L1");
		let mut changeset = ChangeSet::new(1).with(
			ItemEvent::create(
				"hasWrapperAttValue",
				1,
				values([
					(SOURCE_ATTRIBUTE, c1.clone().into()),
					(DESTINATION_ATTRIBUTE, p1.clone().into()),
					(META_ATTRIBUTE, "staff".into()),
				]),
			)
			.with_external_reference(link.clone()),
		);

		let (pending, skipped) = rewrite(&mut changeset);
		let association = &changeset.creations[0];
		let at = EventRef::new(EventKind::Create, 0);

		assert!(skipped.is_empty());
		assert_eq!(
			association.object_id,
			Some(LocalKey::new("hasWrapperAttValue", 1, LocalId(1)))
		);
		assert_eq!(
			association.values.get("extId"),
			Some(&Value::String(link.to_string()))
		);
		assert!(!association.values.contains_key(SOURCE_ATTRIBUTE));
		assert!(!association.values.contains_key(DESTINATION_ATTRIBUTE));
		assert_eq!(
			pending.types[&company()],
			vec![
				TypeAction::ResolveObject {
					reference: c1,
					then: ObjectAction::SetAttribute {
						event: at,
						slot: ValueSlot::New,
						attribute: SOURCE_ATTRIBUTE.to_string(),
					},
				},
				TypeAction::SetRelationAttribute {
					event: at,
					slot: ValueSlot::New,
					attribute: "employees".to_string(),
				},
			]
		);
		assert_eq!(
			pending.types[&person()],
			vec![TypeAction::ResolveObject {
				reference: p1,
				then: ObjectAction::SetAttribute {
					event: at,
					slot: ValueSlot::New,
					attribute: DESTINATION_ATTRIBUTE.to_string(),
				},
			}]
		);
	}

	#[test]
	fn skipped_association_leaves_nothing_pending() {
		let ends = |relation: &str| {
			values([
				(SOURCE_ATTRIBUTE, reference("crm:Company", "C1").into()),
				(DESTINATION_ATTRIBUTE, reference("crm:Person", "P1").into()),
				(META_ATTRIBUTE, relation.into()),
			])
		};
		// the new values are fine, the old ones name a relation that isn't imported
		let mut changeset = ChangeSet::new(1).with(
			ItemEvent::update("hasWrapperAttValue", 1, ends("staff"), Some(ends("owner")))
				.with_external_reference(reference("crm:Employment", "L1")),
		);

		let (pending, skipped) = rewrite(&mut changeset);

		assert!(pending.is_empty());
		assert_eq!(
			skipped,
			HashSet::from([EventRef::new(EventKind::Update, 0)])
		);
	}
}
