use std::{cmp::Ordering, fmt, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Serialize};

/// Identifier of a source partition ("branch") of the remote system.
pub type PartitionId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identity of an object in the local store, assigned once the object is created there.
///
/// The key of a local *type* is a `LocalKey` as well, types are objects of the local store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalKey {
	pub table: String,
	pub partition: PartitionId,
	pub id: LocalId,
}

impl LocalKey {
	pub fn new(table: impl Into<String>, partition: PartitionId, id: LocalId) -> Self {
		Self {
			table: table.into(),
			partition,
			id,
		}
	}
}

impl fmt::Display for LocalKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}:{}", self.table, self.partition, self.id)
	}
}

/// Identity of an object of the remote system, stable for the whole lifetime of that system.
///
/// The canonical text form is `<partition>/<remote type>/<remote name>`, it is what gets stored
/// in the external-id attribute of imported objects. Parsing splits at the first two `/`, so the
/// text form of a remote type containing `/` doesn't parse back.
///
/// References are ordered by partition first and remote name second, which is the order used to
/// batch lookups against the local store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalReference {
	pub remote_type: String,
	pub remote_name: String,
	pub partition: PartitionId,
}

impl ExternalReference {
	pub fn new(
		remote_type: impl Into<String>,
		remote_name: impl Into<String>,
		partition: PartitionId,
	) -> Self {
		Self {
			remote_type: remote_type.into(),
			remote_name: remote_name.into(),
			partition,
		}
	}
}

impl Ord for ExternalReference {
	fn cmp(&self, other: &Self) -> Ordering {
		self.partition
			.cmp(&other.partition)
			.then_with(|| self.remote_name.cmp(&other.remote_name))
			.then_with(|| self.remote_type.cmp(&other.remote_type))
	}
}

impl PartialOrd for ExternalReference {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for ExternalReference {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}/{}/{}",
			self.partition, self.remote_type, self.remote_name
		)
	}
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FormatError {
	#[error("missing '/' separator in external reference <value='{0}'>")]
	MissingSeparator(String),
	#[error("invalid partition in external reference <value='{value}'>: {source}")]
	InvalidPartition {
		value: String,
		#[source]
		source: ParseIntError,
	},
	#[error("empty remote type in external reference <value='{0}'>")]
	EmptyType(String),
}

impl FromStr for ExternalReference {
	type Err = FormatError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.splitn(3, '/');

		let (Some(partition), Some(remote_type), Some(remote_name)) =
			(parts.next(), parts.next(), parts.next())
		else {
			return Err(FormatError::MissingSeparator(s.to_string()));
		};

		let partition = partition
			.parse()
			.map_err(|source| FormatError::InvalidPartition {
				value: s.to_string(),
				source,
			})?;

		if remote_type.is_empty() {
			return Err(FormatError::EmptyType(s.to_string()));
		}

		Ok(Self::new(remote_type, remote_name, partition))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_canonical_form() {
		let reference = "3/people:Person/ann/2024".parse::<ExternalReference>().unwrap();

		assert_eq!(reference.partition, 3);
		assert_eq!(reference.remote_type, "people:Person");
		// names may contain the separator
		assert_eq!(reference.remote_name, "ann/2024");
		assert_eq!(reference.to_string(), "3/people:Person/ann/2024");
	}

	#[test]
	fn rejects_malformed_references() {
		assert!(matches!(
			"1/Person".parse::<ExternalReference>(),
			Err(FormatError::MissingSeparator(_))
		));
		assert!(matches!(
			"main/Person/ann".parse::<ExternalReference>(),
			Err(FormatError::InvalidPartition { .. })
		));
		assert!(matches!(
			"1//ann".parse::<ExternalReference>(),
			Err(FormatError::EmptyType(_))
		));
	}

	#[test]
	fn orders_by_partition_then_name() {
		let mut references = vec![
			ExternalReference::new("B", "b", 2),
			ExternalReference::new("A", "z", 1),
			ExternalReference::new("C", "a", 2),
			ExternalReference::new("A", "c", 1),
		];

		references.sort();

		assert_eq!(
			references
				.iter()
				.map(|r| (r.partition, r.remote_name.as_str()))
				.collect::<Vec<_>>(),
			vec![(1, "c"), (1, "z"), (2, "a"), (2, "b")]
		);
	}
}
