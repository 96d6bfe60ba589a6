use crate::{ExternalReference, LocalKey, PartitionId, Value};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Transient attribute holding the [`ExternalReference`] of the changed object while an event is
/// being imported. It is never a real attribute of the target and is stripped before the event is
/// applied.
pub const EXT_REFERENCE_ATTRIBUTE: &str = "__ext_reference_attribute";

/// Pseudo attribute signalling that an event must be imported as it is, without rewriting.
pub const PLAIN_IMPORT_MARKER: &str = "__plain_import";

/// Attribute holding the key of the local type of an object.
pub const TYPE_ATTRIBUTE: &str = "tType";

pub const SOURCE_ATTRIBUTE: &str = "source";
pub const DESTINATION_ATTRIBUTE: &str = "dest";

/// Attribute of an association naming the relation (the attribute of the source object) the
/// association instantiates.
pub const META_ATTRIBUTE: &str = "metaAttribute";

pub type Values = BTreeMap<String, Value>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
	Create,
	Update,
	Delete,
}

/// Which of the value maps of an event is meant, updates carry the previous values as well.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueSlot {
	New,
	Old,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ItemEvent {
	pub kind: EventKind,
	/// Table (or association table) the event is declared for.
	pub object_type: String,
	/// Partition owning the changed object.
	pub partition: PartitionId,
	/// Local identity, known once the event has been rewritten.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub object_id: Option<LocalKey>,
	pub values: Values,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub old_values: Option<Values>,
}

impl ItemEvent {
	pub fn create(object_type: impl Into<String>, partition: PartitionId, values: Values) -> Self {
		Self::new(EventKind::Create, object_type, partition, values, None)
	}

	pub fn update(
		object_type: impl Into<String>,
		partition: PartitionId,
		values: Values,
		old_values: Option<Values>,
	) -> Self {
		Self::new(EventKind::Update, object_type, partition, values, old_values)
	}

	pub fn delete(object_type: impl Into<String>, partition: PartitionId, values: Values) -> Self {
		Self::new(EventKind::Delete, object_type, partition, values, None)
	}

	fn new(
		kind: EventKind,
		object_type: impl Into<String>,
		partition: PartitionId,
		values: Values,
		old_values: Option<Values>,
	) -> Self {
		Self {
			kind,
			object_type: object_type.into(),
			partition,
			object_id: None,
			values,
			old_values,
		}
	}

	#[must_use]
	pub fn with_external_reference(mut self, reference: ExternalReference) -> Self {
		self.values
			.insert(EXT_REFERENCE_ATTRIBUTE.to_string(), Value::ExtRef(reference));
		self
	}

	#[must_use]
	pub fn external_reference(&self) -> Option<&ExternalReference> {
		self.values
			.get(EXT_REFERENCE_ATTRIBUTE)
			.and_then(Value::as_ext_ref)
	}

	#[must_use]
	pub fn is_plain_import(&self) -> bool {
		self.values
			.get(PLAIN_IMPORT_MARKER)
			.and_then(Value::as_bool)
			.unwrap_or(false)
	}

	#[must_use]
	pub const fn values(&self, slot: ValueSlot) -> Option<&Values> {
		match slot {
			ValueSlot::New => Some(&self.values),
			ValueSlot::Old => self.old_values.as_ref(),
		}
	}

	pub fn values_mut(&mut self, slot: ValueSlot) -> Option<&mut Values> {
		match slot {
			ValueSlot::New => Some(&mut self.values),
			ValueSlot::Old => self.old_values.as_mut(),
		}
	}

	/// Removes the transient import attributes from all value maps of this event.
	pub fn strip_transient_attributes(&mut self) {
		for values in [Some(&mut self.values), self.old_values.as_mut()]
			.into_iter()
			.flatten()
		{
			values.remove(EXT_REFERENCE_ATTRIBUTE);
			values.remove(PLAIN_IMPORT_MARKER);
		}
	}
}
