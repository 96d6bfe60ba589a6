use crate::{EventKind, ItemEvent};

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Position of an event inside a [`ChangeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventRef {
	pub kind: EventKind,
	pub index: usize,
}

impl EventRef {
	#[must_use]
	pub const fn new(kind: EventKind, index: usize) -> Self {
		Self { kind, index }
	}
}

/// All changes of one source revision, in the order they must be applied: creations, updates,
/// deletions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ChangeSet {
	pub revision: i64,
	#[serde(default)]
	pub creations: Vec<ItemEvent>,
	#[serde(default)]
	pub updates: Vec<ItemEvent>,
	#[serde(default)]
	pub deletions: Vec<ItemEvent>,
}

impl ChangeSet {
	#[must_use]
	pub fn new(revision: i64) -> Self {
		Self {
			revision,
			..Default::default()
		}
	}

	/// Appends `event` to the list matching its kind.
	pub fn push(&mut self, event: ItemEvent) -> EventRef {
		let kind = event.kind;
		let list = self.list_mut(kind);
		list.push(event);

		EventRef::new(kind, list.len() - 1)
	}

	#[must_use]
	pub fn with(mut self, event: ItemEvent) -> Self {
		self.push(event);
		self
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.creations.len() + self.updates.len() + self.deletions.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn list(&self, kind: EventKind) -> &[ItemEvent] {
		match kind {
			EventKind::Create => &self.creations,
			EventKind::Update => &self.updates,
			EventKind::Delete => &self.deletions,
		}
	}

	fn list_mut(&mut self, kind: EventKind) -> &mut Vec<ItemEvent> {
		match kind {
			EventKind::Create => &mut self.creations,
			EventKind::Update => &mut self.updates,
			EventKind::Delete => &mut self.deletions,
		}
	}

	#[must_use]
	pub fn event(&self, event_ref: EventRef) -> Option<&ItemEvent> {
		self.list(event_ref.kind).get(event_ref.index)
	}

	pub fn event_mut(&mut self, event_ref: EventRef) -> Option<&mut ItemEvent> {
		self.list_mut(event_ref.kind).get_mut(event_ref.index)
	}

	/// All events with their position, in application order.
	pub fn events(&self) -> impl Iterator<Item = (EventRef, &ItemEvent)> {
		[EventKind::Create, EventKind::Update, EventKind::Delete]
			.into_iter()
			.flat_map(move |kind| {
				self.list(kind)
					.iter()
					.enumerate()
					.map(move |(index, event)| (EventRef::new(kind, index), event))
			})
	}

	pub fn events_mut(&mut self) -> impl Iterator<Item = &mut ItemEvent> {
		self.creations
			.iter_mut()
			.chain(self.updates.iter_mut())
			.chain(self.deletions.iter_mut())
	}

	/// Removes every event named in `dropped`, keeping the relative order of the others.
	///
	/// Invalidates all [`EventRef`]s taken before the call.
	pub fn retain_events(&mut self, dropped: &HashSet<EventRef>) {
		if dropped.is_empty() {
			return;
		}

		for kind in [EventKind::Create, EventKind::Update, EventKind::Delete] {
			let mut index = 0;
			self.list_mut(kind).retain(|_| {
				let keep = !dropped.contains(&EventRef::new(kind, index));
				index += 1;
				keep
			});
		}
	}

	/// Number of events per declared object type, used for diagnostics on large changesets.
	#[must_use]
	pub fn count_by_type(&self) -> BTreeMap<&str, usize> {
		let mut counts = BTreeMap::new();

		for (_, event) in self.events() {
			*counts.entry(event.object_type.as_str()).or_default() += 1;
		}

		counts
	}
}

#[cfg(test)]
mod tests {
	use crate::{ExternalReference, Values};

	use super::*;

	fn event(kind: EventKind, name: &str) -> ItemEvent {
		let values = Values::from([("name".to_string(), name.into())]);

		match kind {
			EventKind::Create => ItemEvent::create("Person", 1, values),
			EventKind::Update => ItemEvent::update("Person", 1, values, None),
			EventKind::Delete => ItemEvent::delete("Person", 1, values),
		}
	}

	#[test]
	fn push_dispatches_by_kind() {
		let mut changeset = ChangeSet::new(7);

		assert_eq!(
			changeset.push(event(EventKind::Update, "a")),
			EventRef::new(EventKind::Update, 0)
		);
		assert_eq!(
			changeset.push(event(EventKind::Create, "b")),
			EventRef::new(EventKind::Create, 0)
		);
		assert_eq!(
			changeset.push(event(EventKind::Update, "c")),
			EventRef::new(EventKind::Update, 1)
		);

		assert_eq!(changeset.len(), 3);
		assert_eq!(
			changeset
				.events()
				.map(|(_, e)| e.values["name"].as_str().unwrap().to_string())
				.collect::<Vec<_>>(),
			vec!["b", "a", "c"]
		);
	}

	#[test]
	fn retain_keeps_relative_order() {
		let mut changeset = ChangeSet::new(1)
			.with(event(EventKind::Create, "a"))
			.with(event(EventKind::Create, "b"))
			.with(event(EventKind::Create, "c"))
			.with(event(EventKind::Delete, "d"));

		changeset.retain_events(&HashSet::from([
			EventRef::new(EventKind::Create, 1),
			EventRef::new(EventKind::Delete, 0),
		]));

		assert_eq!(changeset.len(), 2);
		assert_eq!(changeset.creations[0].values["name"], "a".into());
		assert_eq!(changeset.creations[1].values["name"], "c".into());
		assert!(changeset.deletions.is_empty());
	}

	#[test]
	fn strips_transient_attributes() {
		let mut event = ItemEvent::update(
			"Person",
			1,
			Values::from([(
				crate::PLAIN_IMPORT_MARKER.to_string(),
				crate::Value::Bool(true),
			)]),
			Some(Values::new()),
		)
		.with_external_reference(ExternalReference::new("Person", "P1", 1));

		assert!(event.is_plain_import());
		assert!(event.external_reference().is_some());

		event.strip_transient_attributes();

		assert!(event.values.is_empty());
		assert!(!event.is_plain_import());
	}

	#[test]
	fn deserializes_from_json() {
		let changeset: ChangeSet = serde_json::from_str(
			r#"{
				"revision": 42,
				"creations": [{
					"kind": "Create",
					"object_type": "Person",
					"partition": 1,
					"values": {
						"name": { "type": "string", "value": "Ann" },
						"__ext_reference_attribute": {
							"type": "ext_ref",
							"value": { "remote_type": "Person", "remote_name": "P1", "partition": 1 }
						}
					}
				}]
			}"#,
		)
		.unwrap();

		assert_eq!(changeset.revision, 42);
		assert_eq!(
			changeset.creations[0].external_reference(),
			Some(&ExternalReference::new("Person", "P1", 1))
		);
	}
}
