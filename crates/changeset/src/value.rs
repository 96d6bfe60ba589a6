use crate::{ExternalReference, LocalKey};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute value carried by an [`ItemEvent`](crate::ItemEvent).
///
/// Values coming from the remote system may be [`Value::ExtRef`]s, a changeset handed to the
/// local store only ever contains [`Value::Key`]s in their place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	ExtRef(ExternalReference),
	Key(LocalKey),
}

impl Value {
	#[must_use]
	pub const fn as_ext_ref(&self) -> Option<&ExternalReference> {
		match self {
			Self::ExtRef(reference) => Some(reference),
			_ => None,
		}
	}

	#[must_use]
	pub const fn as_key(&self) -> Option<&LocalKey> {
		match self {
			Self::Key(key) => Some(key),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(s) => Some(s),
			_ => None,
		}
	}

	#[must_use]
	pub const fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Bool(b) => Some(*b),
			_ => None,
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => write!(f, "null"),
			Self::Bool(b) => write!(f, "{b}"),
			Self::Int(i) => write!(f, "{i}"),
			Self::Float(x) => write!(f, "{x}"),
			Self::String(s) => write!(f, "{s}"),
			Self::ExtRef(reference) => write!(f, "ext:{reference}"),
			Self::Key(key) => write!(f, "key:{key}"),
		}
	}
}

impl From<bool> for Value {
	fn from(b: bool) -> Self {
		Self::Bool(b)
	}
}

impl From<i64> for Value {
	fn from(i: i64) -> Self {
		Self::Int(i)
	}
}

impl From<f64> for Value {
	fn from(x: f64) -> Self {
		Self::Float(x)
	}
}

impl From<&str> for Value {
	fn from(s: &str) -> Self {
		Self::String(s.to_string())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Self::String(s)
	}
}

impl From<ExternalReference> for Value {
	fn from(reference: ExternalReference) -> Self {
		Self::ExtRef(reference)
	}
}

impl From<LocalKey> for Value {
	fn from(key: LocalKey) -> Self {
		Self::Key(key)
	}
}
