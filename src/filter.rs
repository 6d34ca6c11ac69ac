//! Boolean filter trees and their translation to the RFC 4515 string syntax.
//!
//! Filters are built from field-lookup predicates, which are checked against
//! the field's syntax when they are built. Once built, a tree is immutable and
//! rendering it is pure: the same tree and server flavor always give the same
//! string.
use std::{
	fmt::{self, Write as _},
	ops::{BitAnd, BitOr},
};

use ldap3::ldap_escape;

use crate::{
	capabilities::Flavor,
	error::Error,
	model::{BooleanCase, Field, FieldKind, Model, Value},
};

/// The comparison a predicate performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
	/// Equality using the attribute's own matching rule
	Equals,
	/// Equality using `caseIgnoreMatch`
	IEquals,
	/// Substring match anywhere in the value
	Contains,
	/// Substring match at the start of the value
	StartsWith,
	/// Substring match at the end of the value
	EndsWith,
	/// Equality with any of a set of values
	In,
	/// Strictly greater than, for integer fields
	Gt,
	/// Greater than or equal, for integer fields
	Gte,
	/// Strictly less than, for integer fields
	Lt,
	/// Less than or equal, for integer fields
	Lte,
	/// Presence (`true`) or absence (`false`) of the attribute
	Exists,
}

impl Operator {
	/// Parse a lookup suffix such as `icontains`. The substring lookups and
	/// their `i` forms are the same operator: substring filters follow the
	/// attribute's substring rule, which ignores case for directory strings.
	#[must_use]
	pub fn from_suffix(suffix: &str) -> Option<Self> {
		Some(match suffix {
			"exact" => Self::Equals,
			"iexact" => Self::IEquals,
			"contains" | "icontains" => Self::Contains,
			"startswith" | "istartswith" => Self::StartsWith,
			"endswith" | "iendswith" => Self::EndsWith,
			"in" => Self::In,
			"gt" => Self::Gt,
			"gte" => Self::Gte,
			"lt" => Self::Lt,
			"lte" => Self::Lte,
			"exists" => Self::Exists,
			_ => return None,
		})
	}
}

/// A single comparison against one attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
	/// The directory attribute compared
	attribute: String,
	/// How booleans are spelled for this attribute
	case: BooleanCase,
	/// Whether values are opaque bytes
	binary: bool,
	/// The comparison
	operator: Operator,
	/// Assertion values; several only for [`Operator::In`]
	values: Vec<Value>,
}

/// A node of a filter tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
	/// A comparison
	Predicate(Predicate),
	/// All children must match. An empty conjunction matches every entry.
	And(Vec<Filter>),
	/// Any child must match. An empty disjunction matches no entry.
	Or(Vec<Filter>),
}

impl Filter {
	/// Build a predicate, checking that the operator and value fit the field.
	pub fn predicate(
		field: &Field,
		operator: Operator,
		value: impl Into<Value>,
	) -> Result<Self, Error> {
		let value = value.into();
		let kind = field.kind();
		let type_error = |what: &str| {
			Error::Configuration(format!(
				"Type error: {what} on field '{}' of kind {kind:?}",
				field.name()
			))
		};

		let values = match operator {
			Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
				if !kind.is_ordered() {
					return Err(type_error("relational operators are only valid for integers"));
				}
				if !matches!(value, Value::Integer(_)) {
					return Err(type_error("relational operators need an integer value"));
				}
				vec![value]
			}
			Operator::IEquals
			| Operator::Contains
			| Operator::StartsWith
			| Operator::EndsWith => {
				if !kind.is_textual() {
					return Err(type_error("string matching is only valid for text"));
				}
				if !matches!(value, Value::Text(_)) {
					return Err(type_error("string matching needs a text value"));
				}
				vec![value]
			}
			Operator::Exists => {
				if !matches!(value, Value::Boolean(_)) {
					return Err(type_error("exists needs a boolean value"));
				}
				vec![value]
			}
			Operator::In => {
				let values = match value {
					Value::TextList(items) => items.into_iter().map(Value::Text).collect(),
					other => vec![other],
				};
				if values.is_empty() {
					return Err(type_error("'in' needs at least one value"));
				}
				for value in &values {
					if value == &Value::Null {
						return Err(type_error("'in' cannot match a null value"));
					}
					field.check(value)?;
				}
				values
			}
			Operator::Equals => {
				if kind != FieldKind::TextList || !matches!(value, Value::TextList(_)) {
					field.check(&value)?;
				}
				match value {
					Value::TextList(items) if !items.is_empty() => {
						return Ok(Self::and(items.into_iter().map(|item| {
							Self::Predicate(Predicate {
								attribute: field.attribute_name().to_owned(),
								case: BooleanCase::Server,
								binary: false,
								operator: Operator::Equals,
								values: vec![Value::Text(item)],
							})
						})));
					}
					Value::TextList(_) => vec![Value::Null],
					other => vec![other],
				}
			}
		};

		Ok(Self::Predicate(Predicate {
			attribute: field.attribute_name().to_owned(),
			case: match kind {
				FieldKind::Boolean(case) => case,
				_ => BooleanCase::Server,
			},
			binary: kind == FieldKind::Binary,
			operator,
			values,
		}))
	}

	/// Build a predicate from a `field__suffix` lookup against a model. A bare
	/// field name is an equality lookup.
	pub fn lookup(model: &Model, lookup: &str, value: impl Into<Value>) -> Result<Self, Error> {
		let (field, operator) = match lookup.rsplit_once("__") {
			Some((name, suffix)) => match Operator::from_suffix(suffix) {
				Some(operator) => (model.field(name)?, operator),
				None => match model.field(lookup) {
					Ok(field) => (field, Operator::Equals),
					Err(_) => {
						return Err(Error::Configuration(format!(
							"Unknown lookup '{suffix}' in '{lookup}'"
						)))
					}
				},
			},
			None => (model.field(lookup)?, Operator::Equals),
		};
		Self::predicate(field, operator, value)
	}

	/// Build a predicate from a pattern with leading and/or trailing `*`.
	pub fn wildcard(field: &Field, pattern: &str) -> Result<Self, Error> {
		if pattern == "*" {
			return Self::predicate(field, Operator::Exists, true);
		}
		let (operator, value) = match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
			(Some(rest), Some(_)) => (Operator::Contains, rest.strip_suffix('*').unwrap_or(rest)),
			(Some(rest), None) => (Operator::EndsWith, rest),
			(None, Some(rest)) => (Operator::StartsWith, rest),
			(None, None) => (Operator::Equals, pattern),
		};
		Self::predicate(field, operator, value)
	}

	/// Equality on `objectClass`, used to restrict queries to a model.
	#[must_use]
	pub fn object_class(object_class: &str) -> Self {
		Self::Predicate(Predicate {
			attribute: "objectClass".to_owned(),
			case: BooleanCase::Server,
			binary: false,
			operator: Operator::Equals,
			values: vec![Value::Text(object_class.to_owned())],
		})
	}

	/// Conjunction of filters. Nested conjunctions are flattened and a single
	/// child is returned as is.
	pub fn and(nodes: impl IntoIterator<Item = Filter>) -> Self {
		Self::combine(nodes, true)
	}

	/// Disjunction of filters. Nested disjunctions are flattened and a single
	/// child is returned as is.
	pub fn or(nodes: impl IntoIterator<Item = Filter>) -> Self {
		Self::combine(nodes, false)
	}

	/// Shared implementation of [`Filter::and`] and [`Filter::or`]
	fn combine(nodes: impl IntoIterator<Item = Filter>, conjunction: bool) -> Self {
		let mut children = Vec::new();
		for node in nodes {
			match node {
				Self::And(inner) if conjunction => children.extend(inner),
				Self::Or(inner) if !conjunction => children.extend(inner),
				other => children.push(other),
			}
		}
		if children.len() == 1 {
			if let Some(only) = children.pop() {
				return only;
			}
		}
		if conjunction {
			Self::And(children)
		} else {
			Self::Or(children)
		}
	}

	/// Whether the filter matches every entry.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		matches!(self, Self::And(children) if children.is_empty())
	}

	/// Render the tree to a filter string for the given server flavor.
	#[must_use]
	pub fn render(&self, flavor: &Flavor) -> String {
		let mut out = String::new();
		self.write(&mut out, flavor, false);
		out
	}

	/// The structure of the tree with all assertion values blanked out. Two
	/// queries with the same shape differ only in the values they look for.
	#[must_use]
	pub fn shape(&self) -> String {
		let mut out = String::new();
		self.write(&mut out, &Flavor::Unknown, true);
		out
	}

	/// Append the rendering of this node to `out`
	fn write(&self, out: &mut String, flavor: &Flavor, blank: bool) {
		match self {
			Self::And(children) if children.is_empty() => out.push_str("(objectClass=*)"),
			Self::And(children) | Self::Or(children) => {
				out.push('(');
				out.push(if matches!(self, Self::And(_)) { '&' } else { '|' });
				for child in children {
					child.write(out, flavor, blank);
				}
				out.push(')');
			}
			Self::Predicate(predicate) => predicate.write(out, flavor, blank),
		}
	}
}

impl Predicate {
	/// The directory attribute compared
	#[must_use]
	pub fn attribute(&self) -> &str {
		&self.attribute
	}

	/// The comparison
	#[must_use]
	pub fn operator(&self) -> Operator {
		self.operator
	}

	/// The assertion values
	#[must_use]
	pub fn values(&self) -> &[Value] {
		&self.values
	}

	/// Escape an assertion value
	fn assertion(&self, value: &Value, flavor: &Flavor, blank: bool) -> String {
		if blank {
			return "?".to_owned();
		}
		let mut out = String::new();
		for raw in value.to_wire(self.case, flavor) {
			match std::str::from_utf8(&raw) {
				Ok(text) if !self.binary => out.push_str(&ldap_escape(text)),
				_ => {
					for byte in raw {
						let _ = write!(out, "\\{byte:02x}");
					}
				}
			}
		}
		out
	}

	/// Append the rendering of this predicate to `out`
	fn write(&self, out: &mut String, flavor: &Flavor, blank: bool) {
		let attribute = &self.attribute;
		let first = self.values.first().unwrap_or(&Value::Null);
		match self.operator {
			Operator::Exists => {
				if first == &Value::Boolean(true) {
					let _ = write!(out, "({attribute}=*)");
				} else {
					let _ = write!(out, "(!({attribute}=*))");
				}
			}
			Operator::Equals if first == &Value::Null => {
				let _ = write!(out, "(!({attribute}=*))");
			}
			Operator::Equals => {
				let _ = write!(out, "({attribute}={})", self.assertion(first, flavor, blank));
			}
			Operator::IEquals => {
				let _ = write!(
					out,
					"({attribute}:caseIgnoreMatch:={})",
					self.assertion(first, flavor, blank)
				);
			}
			Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
				let value = self.assertion(first, flavor, blank);
				if value.is_empty() {
					let _ = write!(out, "({attribute}=*)");
					return;
				}
				let (lead, trail) = match self.operator {
					Operator::Contains => ("*", "*"),
					Operator::StartsWith => ("", "*"),
					_ => ("*", ""),
				};
				let _ = write!(out, "({attribute}={lead}{value}{trail})");
			}
			Operator::In => {
				if let [single] = self.values.as_slice() {
					let _ = write!(out, "({attribute}={})", self.assertion(single, flavor, blank));
					return;
				}
				out.push_str("(|");
				for value in &self.values {
					let _ = write!(out, "({attribute}={})", self.assertion(value, flavor, blank));
				}
				out.push(')');
			}
			Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
				let number = i128::from(first.as_integer().unwrap_or_default());
				let (relation, bound) = match self.operator {
					Operator::Gt => (">=", number + 1),
					Operator::Gte => (">=", number),
					Operator::Lt => ("<=", number - 1),
					_ => ("<=", number),
				};
				if blank {
					let _ = write!(out, "({attribute}{relation}?)");
				} else {
					let _ = write!(out, "({attribute}{relation}{bound})");
				}
			}
		}
	}
}

impl Default for Filter {
	fn default() -> Self {
		Self::And(Vec::new())
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.render(&Flavor::default()))
	}
}

impl BitAnd for Filter {
	type Output = Filter;

	fn bitand(self, rhs: Self) -> Self::Output {
		Self::and([self, rhs])
	}
}

impl BitOr for Filter {
	type Output = Filter;

	fn bitor(self, rhs: Self) -> Self::Output {
		Self::or([self, rhs])
	}
}
