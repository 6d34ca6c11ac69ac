//! Query descriptors and the chainable builder around them.
//!
//! Every builder method of [`QuerySet`] returns a new value and leaves the
//! receiver untouched, so a base query can be refined in several directions
//! without the chains interfering. Nothing is sent to the server until one of
//! the terminal operations in [`crate::manager`] runs.
use std::ops::{Bound, RangeBounds};

use crate::{
	error::Error,
	filter::Filter,
	manager::Manager,
	model::{SortKey, Value},
};

/// Which attributes a query returns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Projection {
	/// All fields, as records
	#[default]
	All,
	/// Only the named fields (plus the primary key), as records
	Only(Vec<String>),
	/// The named fields as raw value rows
	Values(Vec<String>),
}

/// Slice bounds, with the semantics of `[start:stop:step]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slice {
	/// First position, 0-based
	pub start: usize,
	/// Position after the last one, unbounded if `None`
	pub stop: Option<usize>,
	/// Take every `step`-th entry
	pub step: usize,
}

impl Slice {
	/// `[:stop]`, the one shape any paging server serves efficiently
	#[must_use]
	pub fn is_prefix(&self) -> bool {
		self.start == 0 && self.stop.is_some() && self.step == 1
	}

	/// `[start:stop]` with both bounds and a non-zero start
	#[must_use]
	pub fn is_bounded_window(&self) -> bool {
		self.start > 0 && self.stop.is_some()
	}

	/// Number of positions covered, before stepping
	#[must_use]
	pub fn len(&self) -> Option<usize> {
		self.stop.map(|stop| stop.saturating_sub(self.start))
	}

	/// Whether the slice covers no positions
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == Some(0)
	}
}

/// Everything needed to run a search: what to match, in which order, which
/// attributes and which part of the result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
	/// Filter tree, without the model's object class
	pub filter: Filter,
	/// Sort keys, most significant first
	pub ordering: Vec<SortKey>,
	/// Returned attributes
	pub projection: Projection,
	/// Part of the result to return
	pub slice: Option<Slice>,
}

impl Query {
	/// A string identifying queries that differ only in their filter values.
	/// Used to report each kind of degraded query once.
	#[must_use]
	pub fn shape(&self) -> String {
		let ordering = self
			.ordering
			.iter()
			.map(|key| format!("{}{}", if key.descending { "-" } else { "" }, key.field))
			.collect::<Vec<_>>()
			.join(",");
		let slice = match self.slice {
			None => "all",
			Some(slice) if slice.is_prefix() => "prefix",
			Some(slice) if slice.is_bounded_window() => "window",
			Some(_) => "open",
		};
		format!("{} order=[{ordering}] slice={slice}", self.filter.shape())
	}
}

/// A lazily evaluated query against one model.
#[derive(Clone, Debug)]
pub struct QuerySet {
	/// The manager of the model queried
	pub(crate) manager: Manager,
	/// The descriptor built so far
	pub(crate) query: Query,
}

impl QuerySet {
	/// Start from the model's default ordering with no filter.
	pub(crate) fn new(manager: Manager) -> Self {
		let ordering = manager.model().ordering().to_vec();
		Self { manager, query: Query { ordering, ..Query::default() } }
	}

	/// The descriptor built so far
	#[must_use]
	pub fn query(&self) -> &Query {
		&self.query
	}

	/// The manager this query runs on
	#[must_use]
	pub fn manager(&self) -> &Manager {
		&self.manager
	}

	/// A copy of the query.
	#[must_use]
	pub fn all(&self) -> Self {
		self.clone()
	}

	/// Narrow the query with a `field__suffix` lookup.
	pub fn filter(&self, lookup: &str, value: impl Into<Value>) -> Result<Self, Error> {
		let predicate = Filter::lookup(self.manager.model(), lookup, value)?;
		Ok(self.filter_by(predicate))
	}

	/// Narrow the query with a prebuilt filter tree.
	#[must_use]
	pub fn filter_by(&self, filter: Filter) -> Self {
		let mut next = self.clone();
		next.query.filter = if next.query.filter.is_empty() {
			filter
		} else {
			Filter::and([next.query.filter, filter])
		};
		next
	}

	/// Narrow the query with a wildcard pattern such as `*son`.
	pub fn wildcard(&self, field: &str, pattern: &str) -> Result<Self, Error> {
		let predicate = Filter::wildcard(self.manager.model().field(field)?, pattern)?;
		Ok(self.filter_by(predicate))
	}

	/// Replace the ordering. Prefix a field with `-` for descending order;
	/// an empty list removes the ordering.
	pub fn order_by(&self, fields: &[&str]) -> Result<Self, Error> {
		let mut next = self.clone();
		next.query.ordering = self.manager.model().sort_keys(fields)?;
		Ok(next)
	}

	/// Fetch only the named fields. The primary key is always fetched.
	pub fn only(&self, fields: &[&str]) -> Result<Self, Error> {
		if matches!(self.query.projection, Projection::Values(_)) {
			return Err(Error::Configuration(
				"Cannot use only() on a query that returns values".to_owned(),
			));
		}
		let mut next = self.clone();
		next.query.projection = Projection::Only(self.field_names(fields)?);
		Ok(next)
	}

	/// Return rows of raw values for the named fields instead of records.
	/// All fields are returned if the list is empty.
	pub fn values(&self, fields: &[&str]) -> Result<Self, Error> {
		if matches!(self.query.projection, Projection::Only(_)) {
			return Err(Error::Configuration(
				"Cannot use values() on a query restricted with only()".to_owned(),
			));
		}
		let names = if fields.is_empty() {
			self.manager.model().fields().iter().map(|field| field.name().to_owned()).collect()
		} else {
			self.field_names(fields)?
		};
		let mut next = self.clone();
		next.query.projection = Projection::Values(names);
		Ok(next)
	}

	/// Restrict the query to a range of positions. Slicing an already sliced
	/// query slices the previous window.
	pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self, Error> {
		let start = match range.start_bound() {
			Bound::Included(start) => *start,
			Bound::Excluded(start) => start.saturating_add(1),
			Bound::Unbounded => 0,
		};
		let stop = match range.end_bound() {
			Bound::Included(stop) => Some(stop.saturating_add(1)),
			Bound::Excluded(stop) => Some(*stop),
			Bound::Unbounded => None,
		};
		let stop = stop.map(|stop| stop.max(start));

		let slice = match self.query.slice {
			None => Slice { start, stop, step: 1 },
			Some(previous) if previous.step == 1 => {
				let start = previous.start.saturating_add(start);
				let stop = match (previous.stop, stop) {
					(Some(outer), Some(inner)) => Some(outer.min(previous.start.saturating_add(inner))),
					(Some(outer), None) => Some(outer),
					(None, inner) => inner.map(|inner| previous.start.saturating_add(inner)),
				};
				Slice { start, stop: stop.map(|stop| stop.max(start)), step: 1 }
			}
			Some(_) => {
				return Err(Error::Configuration("Cannot slice a query with a step".to_owned()))
			}
		};
		let mut next = self.clone();
		next.query.slice = Some(slice);
		Ok(next)
	}

	/// Take every `step`-th entry of the current slice.
	pub fn step(&self, step: usize) -> Result<Self, Error> {
		if step == 0 {
			return Err(Error::Configuration("Slice step cannot be zero".to_owned()));
		}
		let mut next = self.clone();
		let slice = next.query.slice.get_or_insert(Slice { start: 0, stop: None, step: 1 });
		slice.step = slice.step.saturating_mul(step);
		Ok(next)
	}

	/// Validate field names
	fn field_names(&self, fields: &[&str]) -> Result<Vec<String>, Error> {
		fields
			.iter()
			.map(|name| Ok(self.manager.model().field(name)?.name().to_owned()))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::sync::Arc;

	use super::{Projection, Slice};
	use crate::{
		config::Config,
		error::Error,
		manager::Manager,
		model::{Field, Model},
	};

	fn manager() -> Manager {
		let config: Config = serde_json::from_str(
			r#"{
				"servers": {
					"default": {
						"base_dn": "ou=people,dc=example,dc=com",
						"read": { "url": "ldap://localhost", "bind_dn": "cn=admin", "password": "x" },
						"write": { "url": "ldap://localhost", "bind_dn": "cn=admin", "password": "x" }
					}
				}
			}"#,
		)
		.unwrap();
		let model = Model::builder("User")
			.ordering(&["uid"])
			.field(Field::text("uid").primary_key())
			.field(Field::text("cn"))
			.field(Field::integer("uid_number").attribute("uidNumber"))
			.build()
			.unwrap();
		Manager::new(Arc::new(model), Arc::new(config)).unwrap()
	}

	#[test]
	fn builders_do_not_mutate() {
		let base = manager().all();
		let a = base.filter("uid", "a").unwrap();
		let b = base.filter("uid", "b").unwrap().order_by(&["-cn"]).unwrap();
		assert!(base.query().filter.is_empty());
		assert_eq!(base.query().ordering[0].field, "uid");
		assert_eq!(a.query().filter.to_string(), "(uid=a)");
		assert_eq!(a.query().ordering[0].field, "uid");
		assert!(b.query().ordering[0].descending);
	}

	#[test]
	fn filters_accumulate() {
		let query = manager()
			.all()
			.filter("uid", "a")
			.unwrap()
			.filter("uid_number__gte", 10)
			.unwrap()
			.wildcard("cn", "Jo*")
			.unwrap();
		assert_eq!(query.query().filter.to_string(), "(&(uid=a)(uidNumber>=10)(cn=Jo*))");
	}

	#[test]
	fn slices_compose() {
		let base = manager().all();
		let window = base.slice(10..30).unwrap();
		assert_eq!(window.query().slice, Some(Slice { start: 10, stop: Some(30), step: 1 }));
		let inner = window.slice(5..50).unwrap();
		assert_eq!(inner.query().slice, Some(Slice { start: 15, stop: Some(30), step: 1 }));
		let prefix = base.slice(..5).unwrap();
		assert!(prefix.query().slice.unwrap().is_prefix());
		let open = base.slice(3..).unwrap().slice(..2).unwrap();
		assert_eq!(open.query().slice, Some(Slice { start: 3, stop: Some(5), step: 1 }));

		let stepped = base.slice(..10).unwrap().step(2).unwrap();
		assert_eq!(stepped.query().slice.unwrap().step, 2);
		assert!(matches!(stepped.slice(..1), Err(Error::Configuration(_))));
		assert!(matches!(base.step(0), Err(Error::Configuration(_))));
		assert!(base.slice(5..2).unwrap().query().slice.unwrap().is_empty());
	}

	#[test]
	fn projections_are_exclusive() {
		let base = manager().all();
		let only = base.only(&["cn"]).unwrap();
		assert_eq!(only.query().projection, Projection::Only(vec!["cn".to_owned()]));
		assert!(matches!(only.values(&["cn"]), Err(Error::Configuration(_))));
		let values = base.values(&[]).unwrap();
		assert!(matches!(values.only(&["cn"]), Err(Error::Configuration(_))));
		assert!(matches!(base.only(&["nope"]), Err(Error::Configuration(_))));
	}

	#[test]
	fn shape_ignores_values() {
		let base = manager().all();
		let a = base.filter("uid", "a").unwrap().slice(..5).unwrap();
		let b = base.filter("uid", "b").unwrap().slice(..7).unwrap();
		let c = base.filter("uid", "b").unwrap().slice(2..7).unwrap();
		assert_eq!(a.query().shape(), b.query().shape());
		assert_ne!(b.query().shape(), c.query().shape());
	}
}
