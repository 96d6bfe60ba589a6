#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Imports changesets of a remote system into the local store.
//!
//! Remote events name objects by [`ExternalReference`] and use remote type and attribute names.
//! The [`ImportPipeline`] rewrites every event to local names, resolves all references in batch
//! against the local store (or against objects created earlier in the same changeset) and only
//! then applies the fully local changeset, recording the processed revision alongside.

use std::{num::ParseIntError, path::Path};

mod checkpoint;
mod mapping;
mod pending;
mod pipeline;
mod resolver;
mod rewriter;
mod store;

pub use checkpoint::CheckpointWriter;
pub use mapping::{
	qualified_attribute, CheckpointConfig, ImportConfig, Mapping, ValueMapping, ValueMappingConfig,
	ValueMappingError,
};
pub use pipeline::{ImportOutcome, ImportPipeline};
pub use resolver::ResolutionReport;
pub use store::{LocalObject, LocalType, PropertyStore, Store, StoreError, Transaction};

pub use sd_changeset::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("store error: {0}")]
	Store(#[from] StoreError),
	#[error("failed to record checkpoint <revision={revision}>: {source}")]
	Checkpoint {
		revision: i64,
		#[source]
		source: StoreError,
	},
	#[error("corrupted checkpoint <scope='{scope}', key='{key}', value='{value}'>: {source}")]
	CorruptedCheckpoint {
		scope: String,
		key: String,
		value: String,
		#[source]
		source: ParseIntError,
	},
	#[error(
		"failed to map value of attribute '{attribute}' on type '{owner_type}' <value='{value}'>: {source}"
	)]
	ValueMapping {
		owner_type: String,
		attribute: String,
		value: Value,
		#[source]
		source: ValueMappingError,
	},
	#[error("invalid import configuration: {0}")]
	Config(#[from] serde_json::Error),
	#[error("failed to read import configuration <path='{}'>: {source}", .path.display())]
	ConfigIo {
		path: Box<Path>,
		#[source]
		source: std::io::Error,
	},
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
