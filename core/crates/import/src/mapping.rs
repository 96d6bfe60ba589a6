//! Mapping of remote types, attributes and values to local ones.

use sd_changeset::{LocalKey, Value};

use std::{
	collections::{HashMap, HashSet},
	fmt,
	path::Path,
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::error;

use super::{Error, Result};

/// Separator between a type name and one of its attribute names in qualified attribute names.
pub const QUALIFIED_NAME_SEPARATOR: char = '#';

const DEFAULT_EXTERNAL_ID_ATTRIBUTE: &str = "extId";
const DEFAULT_LOG_SIZE_THRESHOLD: usize = 1000;

#[must_use]
pub fn qualified_attribute(type_name: &str, attribute: &str) -> String {
	format!("{type_name}{QUALIFIED_NAME_SEPARATOR}{attribute}")
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct ValueMappingError(pub String);

/// Converts a remote scalar value into its local form.
pub trait ValueMapping: Send + Sync {
	fn map(&self, value: &Value) -> Result<Value, ValueMappingError>;
}

impl<F> ValueMapping for F
where
	F: Fn(&Value) -> Result<Value, ValueMappingError> + Send + Sync,
{
	fn map(&self, value: &Value) -> Result<Value, ValueMappingError> {
		self(value)
	}
}

/// Lookup tables translating remote names into local ones.
///
/// Anything a mapping doesn't know is deliberately not imported.
pub trait Mapping: Send + Sync {
	/// Key of the local type a remote type is imported as.
	fn map_type(&self, remote_type: &str) -> Option<&LocalKey>;

	/// Local attribute name for a qualified remote attribute, see [`qualified_attribute`].
	fn map_attribute(&self, qualified_remote_attribute: &str) -> Option<&str>;

	fn value_mapping(&self, remote_owner_type: &str, local_attribute: &str)
		-> Option<&dyn ValueMapping>;

	/// Whether events of `object_type` are links between two objects.
	fn is_association(&self, object_type: &str) -> bool;

	/// Attribute of `table` holding the external reference of imported objects.
	fn external_id_attribute(&self, table: &str) -> &str;

	/// Maps `value` of the local attribute `local_attribute` of an object of `remote_owner_type`.
	///
	/// Returns `None` when the value has to be dropped.
	fn map_value(
		&self,
		remote_owner_type: &str,
		local_attribute: &str,
		value: Value,
	) -> Result<Option<Value>> {
		let Some(mapping) = self.value_mapping(remote_owner_type, local_attribute) else {
			return Ok(Some(value));
		};

		if let Value::ExtRef(reference) = &value {
			// external references carry no data a value mapping could work with
			error!(
				%remote_owner_type,
				%local_attribute,
				%reference,
				"Mapping an external reference is not supported, dropping the value;"
			);
			return Ok(None);
		}

		mapping
			.map(&value)
			.map(Some)
			.map_err(|source| Error::ValueMapping {
				owner_type: remote_owner_type.to_string(),
				attribute: local_attribute.to_string(),
				value,
				source,
			})
	}
}

/// Value mappings that can be written down in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ValueMappingConfig {
	/// Replaces string literals found in `values`, other values pass unchanged.
	Literals { values: HashMap<String, Value> },
	/// Renders scalar values as strings.
	ToString,
}

impl ValueMapping for ValueMappingConfig {
	fn map(&self, value: &Value) -> Result<Value, ValueMappingError> {
		match self {
			Self::Literals { values } => Ok(value
				.as_str()
				.and_then(|literal| values.get(literal))
				.unwrap_or(value)
				.clone()),
			Self::ToString => match value {
				Value::Null => Ok(Value::Null),
				Value::String(_) => Ok(value.clone()),
				Value::Bool(_) | Value::Int(_) | Value::Float(_) => Ok(value.to_string().into()),
				Value::ExtRef(_) | Value::Key(_) => Err(ValueMappingError(format!(
					"can't render an object reference as string: {value}"
				))),
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
	/// Scope of the property holding the last processed revision.
	pub scope: String,
	pub key: String,
}

impl Default for CheckpointConfig {
	fn default() -> Self {
		Self {
			scope: "import".to_string(),
			key: "last-revision".to_string(),
		}
	}
}

/// Import configuration, usually stored as JSON next to the library.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
	/// Remote qualified type name to the key of the local type.
	#[serde(default)]
	pub type_mapping: HashMap<String, LocalKey>,

	/// `<remote type>#<remote attribute>` to the local attribute name.
	#[serde(default)]
	pub attribute_mapping: HashMap<String, String>,

	/// Tables holding associations.
	#[serde(default)]
	pub association_types: HashSet<String>,

	/// `<remote type>#<local attribute>` to the mapping applied to its values.
	#[serde(default)]
	pub value_mappings: HashMap<String, ValueMappingConfig>,

	#[serde(default = "default_external_id_attribute")]
	pub external_id_attribute: String,

	/// Per table overrides of `external_id_attribute`.
	#[serde(default)]
	pub external_id_attributes: HashMap<String, String>,

	/// Changesets with more events than this are logged with a summary.
	#[serde(default = "default_log_size_threshold")]
	pub log_size_threshold: usize,

	#[serde(default)]
	pub checkpoint: CheckpointConfig,

	#[serde(skip)]
	custom_value_mappings: HashMap<String, Arc<dyn ValueMapping>>,
}

fn default_external_id_attribute() -> String {
	DEFAULT_EXTERNAL_ID_ATTRIBUTE.to_string()
}

const fn default_log_size_threshold() -> usize {
	DEFAULT_LOG_SIZE_THRESHOLD
}

impl Default for ImportConfig {
	fn default() -> Self {
		Self {
			type_mapping: HashMap::new(),
			attribute_mapping: HashMap::new(),
			association_types: HashSet::new(),
			value_mappings: HashMap::new(),
			external_id_attribute: default_external_id_attribute(),
			external_id_attributes: HashMap::new(),
			log_size_threshold: DEFAULT_LOG_SIZE_THRESHOLD,
			checkpoint: CheckpointConfig::default(),
			custom_value_mappings: HashMap::new(),
		}
	}
}

impl fmt::Debug for ImportConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ImportConfig")
			.field("type_mapping", &self.type_mapping)
			.field("attribute_mapping", &self.attribute_mapping)
			.field("association_types", &self.association_types)
			.field("value_mappings", &self.value_mappings)
			.field("external_id_attribute", &self.external_id_attribute)
			.field("external_id_attributes", &self.external_id_attributes)
			.field("log_size_threshold", &self.log_size_threshold)
			.field("checkpoint", &self.checkpoint)
			.field(
				"custom_value_mappings",
				&self.custom_value_mappings.keys().collect::<Vec<_>>(),
			)
			.finish()
	}
}

impl ImportConfig {
	/// Load the import configuration from a JSON file
	pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();

		let json = tokio::fs::read_to_string(path)
			.await
			.map_err(|source| Error::ConfigIo {
				path: path.into(),
				source,
			})?;

		Self::from_json(&json)
	}

	pub fn from_json(json: &str) -> Result<Self> {
		serde_json::from_str(json).map_err(Into::into)
	}

	/// Registers a value mapping that can't be expressed declaratively. It takes precedence over
	/// a configured one for the same attribute.
	#[must_use]
	pub fn with_value_mapping(
		mut self,
		remote_owner_type: &str,
		local_attribute: &str,
		mapping: impl ValueMapping + 'static,
	) -> Self {
		self.custom_value_mappings.insert(
			qualified_attribute(remote_owner_type, local_attribute),
			Arc::new(mapping),
		);
		self
	}
}

impl Mapping for ImportConfig {
	fn map_type(&self, remote_type: &str) -> Option<&LocalKey> {
		self.type_mapping.get(remote_type)
	}

	fn map_attribute(&self, qualified_remote_attribute: &str) -> Option<&str> {
		self.attribute_mapping
			.get(qualified_remote_attribute)
			.map(String::as_str)
	}

	fn value_mapping(
		&self,
		remote_owner_type: &str,
		local_attribute: &str,
	) -> Option<&dyn ValueMapping> {
		let key = qualified_attribute(remote_owner_type, local_attribute);

		if let Some(mapping) = self.custom_value_mappings.get(&key) {
			return Some(mapping.as_ref());
		}

		let mapping = self.value_mappings.get(&key)?;
		Some(mapping)
	}

	fn is_association(&self, object_type: &str) -> bool {
		self.association_types.contains(object_type)
	}

	fn external_id_attribute(&self, table: &str) -> &str {
		self.external_id_attributes
			.get(table)
			.unwrap_or(&self.external_id_attribute)
	}
}
