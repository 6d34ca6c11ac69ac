//! Attribute-level deltas between two snapshots of an entry.
use std::collections::BTreeSet;

use crate::{
	capabilities::Flavor,
	error::Error,
	model::{Model, Record},
};

/// A change to one attribute of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
	/// Add values to an attribute that had none
	Add {
		/// Attribute name
		attribute: String,
		/// Values to add
		values: Vec<Vec<u8>>,
	},
	/// Remove the attribute entirely
	Delete {
		/// Attribute name
		attribute: String,
	},
	/// Replace all values of the attribute
	Replace {
		/// Attribute name
		attribute: String,
		/// New values
		values: Vec<Vec<u8>>,
	},
}

impl Change {
	/// The attribute the change applies to
	#[must_use]
	pub fn attribute(&self) -> &str {
		match self {
			Self::Add { attribute, .. }
			| Self::Delete { attribute }
			| Self::Replace { attribute, .. } => attribute,
		}
	}
}

/// Compute the changes that turn `old` into `new`. Only editable fields are
/// compared, and the primary key is left out since changing it requires a
/// rename. Values are compared as sets, so reordering a multi-valued field is
/// not a change.
pub fn diff(model: &Model, old: &Record, new: &Record, flavor: &Flavor) -> Result<Vec<Change>, Error> {
	let mut changes = Vec::new();
	for field in model.fields() {
		if !field.is_editable() || field.is_primary_key() {
			continue;
		}
		let before = field.encode(old.value(field.name()), flavor)?;
		let after = field.encode(new.value(field.name()), flavor)?;
		if before.iter().collect::<BTreeSet<_>>() == after.iter().collect::<BTreeSet<_>>() {
			continue;
		}
		let attribute = field.attribute_name().to_owned();
		changes.push(match (before.is_empty(), after.is_empty()) {
			(_, true) => Change::Delete { attribute },
			(true, false) => Change::Add { attribute, values: after },
			(false, false) => Change::Replace { attribute, values: after },
		});
	}
	Ok(changes)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::sync::Arc;

	use super::{diff, Change};
	use crate::{
		capabilities::Flavor,
		model::{Field, Model, Record},
	};

	fn model() -> Arc<Model> {
		Arc::new(
			Model::builder("User")
				.field(Field::text("uid").primary_key())
				.field(Field::text("cn"))
				.field(Field::text("sn"))
				.field(Field::text_list("mail"))
				.field(Field::integer("uid_number").attribute("uidNumber"))
				.field(Field::text("modified").attribute("modifyTimestamp").read_only())
				.build()
				.unwrap(),
		)
	}

	fn alice(model: &Arc<Model>) -> Record {
		Record::new(model)
			.with("uid", "alice")
			.unwrap()
			.with("cn", "Alice")
			.unwrap()
			.with("sn", "Liddell")
			.unwrap()
			.with("mail", vec!["a@example.com".to_owned(), "b@example.com".to_owned()])
			.unwrap()
	}

	#[test]
	fn single_change() {
		let model = model();
		let old = alice(&model);
		let new = old.clone().with("cn", "Alice Liddell").unwrap();
		assert_eq!(diff(&model, &old, &new, &Flavor::Unknown).unwrap(), vec![Change::Replace {
			attribute: "cn".to_owned(),
			values: vec![b"Alice Liddell".to_vec()]
		}]);
	}

	#[test]
	fn add_and_delete() {
		let model = model();
		let old = alice(&model);
		let new = old.clone().with("uid_number", 1001).unwrap().with("sn", None::<String>).unwrap();
		let changes = diff(&model, &old, &new, &Flavor::Unknown).unwrap();
		assert_eq!(changes, vec![
			Change::Delete { attribute: "sn".to_owned() },
			Change::Add { attribute: "uidNumber".to_owned(), values: vec![b"1001".to_vec()] },
		]);
	}

	#[test]
	fn unchanged_fields_are_ignored() {
		let model = model();
		let old = alice(&model);
		let new = old
			.clone()
			.with("mail", vec!["b@example.com".to_owned(), "a@example.com".to_owned()])
			.unwrap()
			.with("modified", "20240101000000Z")
			.unwrap()
			.with("uid", "bob")
			.unwrap();
		assert!(diff(&model, &old, &new, &Flavor::Unknown).unwrap().is_empty());
	}
}
