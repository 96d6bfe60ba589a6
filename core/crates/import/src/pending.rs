//! Per changeset bookkeeping of everything that can only be decided once local types and
//! objects are known.

use sd_changeset::{EventRef, ExternalReference, LocalKey, ValueSlot};

use std::collections::HashMap;

/// What to do with an event once the local object behind an [`ExternalReference`] is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectAction {
	/// The event changes the found object.
	SetObjectId(EventRef),
	/// The key of the found object is the value of `attribute`.
	SetAttribute {
		event: EventRef,
		slot: ValueSlot,
		attribute: String,
	},
}

impl ObjectAction {
	pub const fn event(&self) -> EventRef {
		match self {
			Self::SetObjectId(event) | Self::SetAttribute { event, .. } => *event,
		}
	}
}

/// What to do with an event once a local type is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeAction {
	/// The event creates a new object of the loaded type.
	AssignNewId {
		event: EventRef,
		reference: ExternalReference,
	},
	/// `reference` names an object stored in the table of the loaded type.
	ResolveObject {
		reference: ExternalReference,
		then: ObjectAction,
	},
	/// Writes the external id of the changed object, the table decides about the attribute name.
	SetExternalId {
		event: EventRef,
		reference: ExternalReference,
	},
	/// The association instantiates the local `attribute` of the loaded (source) type.
	SetRelationAttribute {
		event: EventRef,
		slot: ValueSlot,
		attribute: String,
	},
}

impl TypeAction {
	pub const fn event(&self) -> EventRef {
		match self {
			Self::AssignNewId { event, .. }
			| Self::SetExternalId { event, .. }
			| Self::SetRelationAttribute { event, .. } => *event,
			Self::ResolveObject { then, .. } => then.event(),
		}
	}
}

/// Pending resolutions of one changeset.
///
/// Created empty for every changeset and consumed by the resolution, so nothing survives from
/// one changeset to the next.
#[derive(Debug, Default)]
pub struct PendingResolutions {
	/// Actions waiting for a local type, by type key.
	pub types: HashMap<LocalKey, Vec<TypeAction>>,
	/// Actions waiting for a local object, by table and reference.
	pub objects: HashMap<String, HashMap<ExternalReference, Vec<ObjectAction>>>,
	/// Objects created by the changeset being imported.
	pub created: HashMap<ExternalReference, LocalKey>,
	/// Number of actions registered so far, never decreases.
	registrations: usize,
}

impl PendingResolutions {
	pub fn on_type(&mut self, type_key: &LocalKey, action: TypeAction) {
		self.registrations += 1;
		self.types.entry(type_key.clone()).or_default().push(action);
	}

	pub fn on_object(&mut self, table: &str, reference: ExternalReference, action: ObjectAction) {
		self.registrations += 1;
		self.objects
			.entry(table.to_string())
			.or_default()
			.entry(reference)
			.or_default()
			.push(action);
	}

	pub fn object_created(&mut self, reference: ExternalReference, key: LocalKey) {
		self.created.insert(reference, key);
	}

	/// Changes whenever an action is registered, tells whether an event left anything behind.
	#[must_use]
	pub const fn registrations(&self) -> usize {
		self.registrations
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.types.is_empty() && self.objects.is_empty()
	}

	/// Drops every action registered for `event`, the event won't be part of the result.
	pub fn forget_event(&mut self, event: EventRef) {
		self.types.retain(|_, actions| {
			actions.retain(|action| action.event() != event);
			!actions.is_empty()
		});

		self.objects.retain(|_, by_reference| {
			by_reference.retain(|_, actions| {
				actions.retain(|action| action.event() != event);
				!actions.is_empty()
			});
			!by_reference.is_empty()
		});
	}
}

#[cfg(test)]
mod tests {
	use sd_changeset::{EventKind, LocalId};

	use super::*;

	fn person_type() -> LocalKey {
		LocalKey::new("MetaElement", 1, LocalId(17))
	}

	#[test]
	fn collects_actions_by_type_and_reference() {
		let mut pending = PendingResolutions::default();
		let p1 = ExternalReference::new("crm:Person", "P1", 1);
		let first = EventRef::new(EventKind::Create, 0);
		let second = EventRef::new(EventKind::Update, 0);

		pending.on_type(
			&person_type(),
			TypeAction::AssignNewId {
				event: first,
				reference: p1.clone(),
			},
		);
		pending.on_type(
			&person_type(),
			TypeAction::ResolveObject {
				reference: p1.clone(),
				then: ObjectAction::SetObjectId(second),
			},
		);
		pending.on_object("Person", p1.clone(), ObjectAction::SetObjectId(second));
		pending.on_object(
			"Person",
			p1.clone(),
			ObjectAction::SetAttribute {
				event: first,
				slot: ValueSlot::New,
				attribute: "boss".to_string(),
			},
		);

		assert_eq!(pending.types[&person_type()].len(), 2);
		assert_eq!(pending.objects["Person"][&p1].len(), 2);
		assert!(!pending.is_empty());
	}

	#[test]
	fn forgetting_an_event_removes_all_its_actions() {
		let mut pending = PendingResolutions::default();
		let p1 = ExternalReference::new("crm:Person", "P1", 1);
		let kept = EventRef::new(EventKind::Create, 0);
		let skipped = EventRef::new(EventKind::Update, 3);

		pending.on_type(
			&person_type(),
			TypeAction::ResolveObject {
				reference: p1.clone(),
				then: ObjectAction::SetAttribute {
					event: skipped,
					slot: ValueSlot::Old,
					attribute: "boss".to_string(),
				},
			},
		);
		pending.on_object("Person", p1.clone(), ObjectAction::SetObjectId(skipped));
		pending.on_type(
			&person_type(),
			TypeAction::SetExternalId {
				event: kept,
				reference: p1,
			},
		);

		pending.forget_event(skipped);

		assert!(pending.objects.is_empty());
		assert_eq!(
			pending.types[&person_type()]
				.iter()
				.map(TypeAction::event)
				.collect::<Vec<_>>(),
			vec![kept]
		);

		pending.forget_event(kept);
		assert!(pending.is_empty());
		assert_eq!(pending.registrations(), 3);
	}

	#[test]
	fn registrations_count_every_action() {
		let mut pending = PendingResolutions::default();
		let p1 = ExternalReference::new("crm:Person", "P1", 1);
		let at = EventRef::new(EventKind::Delete, 0);

		assert_eq!(pending.registrations(), 0);

		pending.object_created(p1.clone(), LocalKey::new("Person", 1, LocalId(1)));
		assert_eq!(pending.registrations(), 0);

		pending.on_object("Person", p1.clone(), ObjectAction::SetObjectId(at));
		pending.on_object("Person", p1, ObjectAction::SetObjectId(at));
		assert_eq!(pending.registrations(), 2);
	}
}
