//! Field-set descriptors for directory entries.
//!
//! A [`Model`] is built once per entity type with a [`ModelBuilder`]: it lists
//! the fields, maps each of them to a directory attribute and knows how to
//! convert between native [`Value`]s and wire values. The configuration is
//! validated when the model is built, so no query can run against a model with
//! duplicate fields, a missing primary key or an ordering on an undeclared
//! field.
use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashMap, HashSet},
	sync::Arc,
};

use ldap3::{dn_escape, SearchEntry};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{capabilities::Flavor, config::TIME_FORMAT, entry::SearchEntryExt, error::Error};

/// How booleans are spelled on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BooleanCase {
	/// `TRUE` / `FALSE`, the RFC 4517 Boolean syntax
	Upper,
	/// `true` / `false`, common in schemas that store booleans as strings
	Lower,
	/// Follow the detected server flavor
	Server,
}

/// The syntax of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
	/// A single-valued string
	Text,
	/// A multi-valued string
	TextList,
	/// A single-valued integer. The only kind that supports relational
	/// operators.
	Integer,
	/// A boolean
	Boolean(BooleanCase),
	/// Opaque bytes, like `objectGUID` or `jpegPhoto`
	Binary,
	/// A generalized time
	DateTime,
}

impl FieldKind {
	/// Whether `>`, `>=`, `<` and `<=` may be used on the field.
	#[must_use]
	pub fn is_ordered(self) -> bool {
		matches!(self, Self::Integer)
	}

	/// Whether substring matching makes sense for the field.
	#[must_use]
	pub fn is_textual(self) -> bool {
		matches!(self, Self::Text | Self::TextList)
	}

	/// Whether a single assertion value fits this kind.
	#[must_use]
	pub fn accepts(self, value: &Value) -> bool {
		matches!(
			(self, value),
			(_, Value::Null)
				| (Self::Text | Self::TextList, Value::Text(_))
				| (Self::TextList, Value::TextList(_))
				| (Self::Integer, Value::Integer(_))
				| (Self::Boolean(_), Value::Boolean(_))
				| (Self::Binary, Value::Binary(_))
				| (Self::DateTime, Value::DateTime(_))
		)
	}

	/// Convert wire values into a native value.
	fn decode(self, attribute: &str, values: &[&[u8]]) -> Result<Value, Error> {
		let Some(first) = values.first() else {
			return Ok(match self {
				Self::TextList => Value::TextList(Vec::new()),
				_ => Value::Null,
			});
		};
		let text = |raw: &[u8]| {
			std::str::from_utf8(raw)
				.map(str::to_owned)
				.map_err(|_| Error::Invalid(format!("{attribute} is not valid UTF-8")))
		};
		Ok(match self {
			Self::Text => Value::Text(text(first)?),
			Self::TextList => Value::TextList(
				values.iter().map(|raw| text(raw)).collect::<Result<Vec<_>, _>>()?,
			),
			Self::Integer => Value::Integer(
				text(first)?
					.trim()
					.parse()
					.map_err(|_| Error::Invalid(format!("{attribute} is not an integer")))?,
			),
			Self::Boolean(_) => {
				let raw = text(first)?;
				if raw.eq_ignore_ascii_case("true") {
					Value::Boolean(true)
				} else if raw.eq_ignore_ascii_case("false") {
					Value::Boolean(false)
				} else {
					return Err(Error::Invalid(format!("{attribute} is not a boolean")));
				}
			}
			Self::Binary => Value::Binary(first.to_vec()),
			Self::DateTime => Value::DateTime(
				PrimitiveDateTime::parse(&text(first)?, &TIME_FORMAT)
					.map_err(|_| Error::Invalid(format!("{attribute} is not a generalized time")))?
					.assume_utc(),
			),
		})
	}
}

/// A native value of a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
	/// The attribute is absent
	Null,
	/// A string
	Text(String),
	/// Several strings
	TextList(Vec<String>),
	/// An integer
	Integer(i64),
	/// A boolean
	Boolean(bool),
	/// Raw bytes
	Binary(Vec<u8>),
	/// A point in time
	DateTime(OffsetDateTime),
}

impl Value {
	/// Whether the value would be written as an absent attribute.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		match self {
			Self::Null => true,
			Self::TextList(values) => values.is_empty(),
			_ => false,
		}
	}

	/// The value as a string, if it is one.
	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Self::Text(text) => Some(text),
			_ => None,
		}
	}

	/// The value as an integer, if it is one.
	#[must_use]
	pub fn as_integer(&self) -> Option<i64> {
		match self {
			Self::Integer(value) => Some(*value),
			_ => None,
		}
	}

	/// Encode to wire values. `case` only matters for booleans.
	pub(crate) fn to_wire(&self, case: BooleanCase, flavor: &Flavor) -> Vec<Vec<u8>> {
		match self {
			Self::Null => Vec::new(),
			Self::Text(text) => vec![text.as_bytes().to_vec()],
			Self::TextList(values) => values.iter().map(|text| text.as_bytes().to_vec()).collect(),
			Self::Integer(value) => vec![value.to_string().into_bytes()],
			Self::Boolean(value) => {
				let upper = match case {
					BooleanCase::Upper => true,
					BooleanCase::Lower => false,
					BooleanCase::Server => flavor.uses_uppercase_booleans(),
				};
				let literal = match (value, upper) {
					(true, true) => "TRUE",
					(false, true) => "FALSE",
					(true, false) => "true",
					(false, false) => "false",
				};
				vec![literal.as_bytes().to_vec()]
			}
			Self::Binary(bytes) => vec![bytes.clone()],
			Self::DateTime(time) => vec![generalized_time(*time).into_bytes()],
		}
	}

	/// A total order used for client-side sorting. Absent values sort first,
	/// values of different kinds are ordered by kind.
	#[must_use]
	pub fn sort_cmp(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Self::Text(a), Self::Text(b)) => a.cmp(b),
			(Self::TextList(a), Self::TextList(b)) => a.cmp(b),
			(Self::Integer(a), Self::Integer(b)) => a.cmp(b),
			(Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
			(Self::Binary(a), Self::Binary(b)) => a.cmp(b),
			(Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
			_ => self.rank().cmp(&other.rank()),
		}
	}

	/// Position of the variant in the cross-kind order
	fn rank(&self) -> u8 {
		match self {
			Self::Null => 0,
			Self::Boolean(_) => 1,
			Self::Integer(_) => 2,
			Self::DateTime(_) => 3,
			Self::Text(_) => 4,
			Self::TextList(_) => 5,
			Self::Binary(_) => 6,
		}
	}
}

/// Format a time in the generalized time syntax, always in UTC.
fn generalized_time(time: OffsetDateTime) -> String {
	let time = time.to_offset(UtcOffset::UTC);
	format!(
		"{:04}{:02}{:02}{:02}{:02}{:02}Z",
		time.year(),
		u8::from(time.month()),
		time.day(),
		time.hour(),
		time.minute(),
		time.second()
	)
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Self::Text(value.to_owned())
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl From<Vec<String>> for Value {
	fn from(value: Vec<String>) -> Self {
		Self::TextList(value)
	}
}

impl From<i64> for Value {
	fn from(value: i64) -> Self {
		Self::Integer(value)
	}
}

impl From<i32> for Value {
	fn from(value: i32) -> Self {
		Self::Integer(value.into())
	}
}

impl From<bool> for Value {
	fn from(value: bool) -> Self {
		Self::Boolean(value)
	}
}

impl From<Vec<u8>> for Value {
	fn from(value: Vec<u8>) -> Self {
		Self::Binary(value)
	}
}

impl From<OffsetDateTime> for Value {
	fn from(value: OffsetDateTime) -> Self {
		Self::DateTime(value)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map_or(Self::Null, Into::into)
	}
}

/// A field of a model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
	/// Name used in queries
	name: String,
	/// Directory attribute the field is stored in
	attribute: String,
	/// Syntax of the field
	kind: FieldKind,
	/// Whether the field is the naming attribute of entries
	primary_key: bool,
	/// Whether the field is written on create and modify
	editable: bool,
}

impl Field {
	/// A field stored in an attribute of the same name.
	#[must_use]
	pub fn new(name: &str, kind: FieldKind) -> Self {
		Self {
			name: name.to_owned(),
			attribute: name.to_owned(),
			kind,
			primary_key: false,
			editable: true,
		}
	}

	/// A single-valued string field.
	#[must_use]
	pub fn text(name: &str) -> Self {
		Self::new(name, FieldKind::Text)
	}

	/// A multi-valued string field.
	#[must_use]
	pub fn text_list(name: &str) -> Self {
		Self::new(name, FieldKind::TextList)
	}

	/// An integer field.
	#[must_use]
	pub fn integer(name: &str) -> Self {
		Self::new(name, FieldKind::Integer)
	}

	/// A boolean field following the server's spelling of booleans.
	#[must_use]
	pub fn boolean(name: &str) -> Self {
		Self::new(name, FieldKind::Boolean(BooleanCase::Server))
	}

	/// A binary field.
	#[must_use]
	pub fn binary(name: &str) -> Self {
		Self::new(name, FieldKind::Binary)
	}

	/// A generalized time field.
	#[must_use]
	pub fn datetime(name: &str) -> Self {
		Self::new(name, FieldKind::DateTime)
	}

	/// Store the field in a differently named attribute.
	#[must_use]
	pub fn attribute(mut self, attribute: &str) -> Self {
		attribute.clone_into(&mut self.attribute);
		self
	}

	/// Mark the field as the primary key.
	#[must_use]
	pub fn primary_key(mut self) -> Self {
		self.primary_key = true;
		self
	}

	/// Never write the field.
	#[must_use]
	pub fn read_only(mut self) -> Self {
		self.editable = false;
		self
	}

	/// Name used in queries
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Directory attribute name
	#[must_use]
	pub fn attribute_name(&self) -> &str {
		&self.attribute
	}

	/// Syntax of the field
	#[must_use]
	pub fn kind(&self) -> FieldKind {
		self.kind
	}

	/// Whether the field is the primary key
	#[must_use]
	pub fn is_primary_key(&self) -> bool {
		self.primary_key
	}

	/// Whether the field is written
	#[must_use]
	pub fn is_editable(&self) -> bool {
		self.editable
	}

	/// Check that a value fits the field.
	pub fn check(&self, value: &Value) -> Result<(), Error> {
		let fits = match (self.kind, value) {
			(FieldKind::Text, Value::TextList(_)) => false,
			(kind, value) => kind.accepts(value),
		};
		if fits {
			Ok(())
		} else {
			Err(Error::Configuration(format!(
				"Type error: {value:?} is not a valid value for {:?} field '{}'",
				self.kind, self.name
			)))
		}
	}

	/// Convert a native value into wire values.
	pub fn encode(&self, value: &Value, flavor: &Flavor) -> Result<Vec<Vec<u8>>, Error> {
		self.check(value)?;
		let case = match self.kind {
			FieldKind::Boolean(case) => case,
			_ => BooleanCase::Server,
		};
		Ok(value.to_wire(case, flavor))
	}

	/// Convert wire values into a native value.
	pub fn decode(&self, values: &[&[u8]]) -> Result<Value, Error> {
		self.kind.decode(&self.attribute, values)
	}
}

/// A sort key: a field and a direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortKey {
	/// Field name
	pub field: String,
	/// Directory attribute of the field
	pub attribute: String,
	/// Sort in descending order
	pub descending: bool,
}

/// The description of an entity type stored in the directory.
#[derive(Debug)]
pub struct Model {
	/// Name of the entity type, used in messages
	name: String,
	/// Server profile the model lives on
	server: String,
	/// Where entries live, overriding the profile default
	base_dn: Option<String>,
	/// Object class that identifies entries of this model
	object_class: Option<String>,
	/// Object classes written in addition on create
	extra_object_classes: Vec<String>,
	/// Default ordering
	ordering: Vec<SortKey>,
	/// The fields, in declaration order
	fields: Vec<Field>,
	/// Field index by name
	by_name: HashMap<String, usize>,
	/// Index of the primary key field
	primary_key: usize,
}

/// Builder for [`Model`]s.
#[derive(Debug)]
pub struct ModelBuilder {
	/// Name of the entity type
	name: String,
	/// Server profile name
	server: String,
	/// Base DN override
	base_dn: Option<String>,
	/// Identifying object class
	object_class: Option<String>,
	/// Extra object classes for create
	extra_object_classes: Vec<String>,
	/// Default ordering, unparsed
	ordering: Vec<String>,
	/// Declared fields
	fields: Vec<Field>,
}

impl ModelBuilder {
	/// Use the given server profile instead of `default`.
	#[must_use]
	pub fn server(mut self, server: &str) -> Self {
		server.clone_into(&mut self.server);
		self
	}

	/// Store entries below this DN instead of the profile's base DN.
	#[must_use]
	pub fn base_dn(mut self, base_dn: &str) -> Self {
		self.base_dn = Some(base_dn.to_owned());
		self
	}

	/// Restrict all queries to entries with this object class.
	#[must_use]
	pub fn object_class(mut self, object_class: &str) -> Self {
		self.object_class = Some(object_class.to_owned());
		self
	}

	/// Add an object class written on create only.
	#[must_use]
	pub fn extra_object_class(mut self, object_class: &str) -> Self {
		self.extra_object_classes.push(object_class.to_owned());
		self
	}

	/// Default ordering; prefix a field with `-` for descending.
	#[must_use]
	pub fn ordering(mut self, fields: &[&str]) -> Self {
		self.ordering = fields.iter().map(|field| (*field).to_owned()).collect();
		self
	}

	/// Declare a field.
	#[must_use]
	pub fn field(mut self, field: Field) -> Self {
		self.fields.push(field);
		self
	}

	/// Validate the declaration and build the model.
	pub fn build(self) -> Result<Model, Error> {
		let mut by_name = HashMap::new();
		let mut attributes = HashSet::new();
		for (index, field) in self.fields.iter().enumerate() {
			if by_name.insert(field.name.clone(), index).is_some() {
				return Err(Error::Configuration(format!(
					"{}: field '{}' is declared twice",
					self.name, field.name
				)));
			}
			if !attributes.insert(field.attribute.to_ascii_lowercase()) {
				return Err(Error::Configuration(format!(
					"{}: attribute '{}' is mapped by more than one field",
					self.name, field.attribute
				)));
			}
		}

		let mut keys = self.fields.iter().enumerate().filter(|(_, field)| field.primary_key);
		let primary_key = match (keys.next(), keys.next()) {
			(Some((index, field)), None) => {
				if !matches!(field.kind, FieldKind::Text | FieldKind::Integer) {
					return Err(Error::Configuration(format!(
						"{}: primary key '{}' must be a text or integer field",
						self.name, field.name
					)));
				}
				index
			}
			(None, _) => {
				return Err(Error::Configuration(format!("{}: no primary key declared", self.name)))
			}
			(Some(_), Some(_)) => {
				return Err(Error::Configuration(format!(
					"{}: more than one primary key declared",
					self.name
				)))
			}
		};

		let mut model = Model {
			name: self.name,
			server: self.server,
			base_dn: self.base_dn,
			object_class: self.object_class,
			extra_object_classes: self.extra_object_classes,
			ordering: Vec::new(),
			fields: self.fields,
			by_name,
			primary_key,
		};
		let ordering = self.ordering.iter().map(String::as_str).collect::<Vec<_>>();
		model.ordering = model.sort_keys(&ordering)?;
		Ok(model)
	}
}

impl Model {
	/// Start declaring a model.
	#[must_use]
	pub fn builder(name: &str) -> ModelBuilder {
		ModelBuilder {
			name: name.to_owned(),
			server: "default".to_owned(),
			base_dn: None,
			object_class: None,
			extra_object_classes: Vec::new(),
			ordering: Vec::new(),
			fields: Vec::new(),
		}
	}

	/// Name of the entity type
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Server profile name
	#[must_use]
	pub fn server(&self) -> &str {
		&self.server
	}

	/// Base DN override
	#[must_use]
	pub fn base_dn(&self) -> Option<&str> {
		self.base_dn.as_deref()
	}

	/// Identifying object class
	#[must_use]
	pub fn object_class(&self) -> Option<&str> {
		self.object_class.as_deref()
	}

	/// Default ordering
	#[must_use]
	pub fn ordering(&self) -> &[SortKey] {
		&self.ordering
	}

	/// All fields in declaration order
	#[must_use]
	pub fn fields(&self) -> &[Field] {
		&self.fields
	}

	/// The primary key field
	#[must_use]
	pub fn primary_key(&self) -> &Field {
		&self.fields[self.primary_key]
	}

	/// Look up a field by name. `pk` is accepted as an alias for the primary
	/// key.
	pub fn field(&self, name: &str) -> Result<&Field, Error> {
		if name == "pk" {
			return Ok(self.primary_key());
		}
		self.by_name.get(name).map(|index| &self.fields[*index]).ok_or_else(|| {
			Error::Configuration(format!("'{name}' is not a valid field on model {}", self.name))
		})
	}

	/// Attribute names of all fields.
	#[must_use]
	pub fn attributes(&self) -> Vec<String> {
		self.fields.iter().map(|field| field.attribute.clone()).collect()
	}

	/// Parse field names, optionally prefixed with `-`, into sort keys.
	pub fn sort_keys(&self, fields: &[&str]) -> Result<Vec<SortKey>, Error> {
		fields
			.iter()
			.map(|term| {
				let (name, descending) = match term.strip_prefix('-') {
					Some(name) => (name, true),
					None => (*term, false),
				};
				let field = self.field(name)?;
				Ok(SortKey {
					field: field.name.clone(),
					attribute: field.attribute.clone(),
					descending,
				})
			})
			.collect()
	}

	/// The DN of the entry whose primary key has the given value.
	pub fn dn_for(&self, pk: &Value, base_dn: &str) -> Result<String, Error> {
		let key = self.primary_key();
		let value = match pk {
			Value::Text(text) if !text.is_empty() => text.clone(),
			Value::Integer(value) => value.to_string(),
			_ => {
				return Err(Error::Missing(format!(
					"{}: no value for primary key '{}'",
					self.name, key.name
				)))
			}
		};
		Ok(format!("{}={},{base_dn}", key.attribute, dn_escape(value.as_str())))
	}

	/// Decode a search result. With a projection, only the listed fields are
	/// decoded; the primary key always is.
	pub fn decode(
		self: &Arc<Self>,
		entry: &SearchEntry,
		projection: Option<&[String]>,
	) -> Result<Record, Error> {
		let mut record = Record::new(self);
		record.dn = Some(entry.dn.clone());
		for field in &self.fields {
			let wanted = field.primary_key
				|| projection.map_or(true, |names| names.iter().any(|name| *name == field.name));
			if !wanted {
				continue;
			}
			let value = field.decode(&entry.attr_values(&field.attribute))?;
			if field.primary_key && value.is_empty() {
				return Err(Error::Missing(format!(
					"{} has no value for the primary key attribute {}",
					entry.dn, field.attribute
				)));
			}
			record.values.insert(field.name.clone(), value);
		}
		Ok(record)
	}

	/// Object classes written when creating an entry.
	pub fn object_classes(&self) -> Result<Vec<String>, Error> {
		let classes = self
			.extra_object_classes
			.iter()
			.chain(self.object_class.iter())
			.cloned()
			.collect::<Vec<_>>();
		if classes.is_empty() {
			return Err(Error::Configuration(format!(
				"{}: tried to add an entry with no object classes defined",
				self.name
			)));
		}
		Ok(classes)
	}

	/// Attributes for an add request: every editable, non-empty field plus
	/// the object classes.
	pub fn add_attributes(
		&self,
		record: &Record,
		flavor: &Flavor,
	) -> Result<Vec<(String, HashSet<Vec<u8>>)>, Error> {
		let mut attributes = vec![(
			"objectClass".to_owned(),
			self.object_classes()?.into_iter().map(String::into_bytes).collect(),
		)];
		for field in &self.fields {
			let value = record.value(&field.name);
			if !field.editable || value.is_empty() {
				continue;
			}
			attributes
				.push((field.attribute.clone(), field.encode(value, flavor)?.into_iter().collect()));
		}
		Ok(attributes)
	}
}

/// A snapshot of an entry of some model.
#[derive(Clone, Debug)]
pub struct Record {
	/// The model the record belongs to
	model: Arc<Model>,
	/// DN of the entry, if it was read from or written to the directory
	dn: Option<String>,
	/// Field values by field name
	values: BTreeMap<String, Value>,
}

impl PartialEq for Record {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.model, &other.model) && self.dn == other.dn && self.values == other.values
	}
}

/// Placeholder handed out for fields without a value
static NULL: Value = Value::Null;

impl Record {
	/// An empty record of the given model.
	#[must_use]
	pub fn new(model: &Arc<Model>) -> Self {
		Self { model: Arc::clone(model), dn: None, values: BTreeMap::new() }
	}

	/// Set a field. Fails for undeclared fields and mismatched values.
	pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<&mut Self, Error> {
		let value = value.into();
		let field = self.model.field(field)?;
		field.check(&value)?;
		self.values.insert(field.name.clone(), value);
		Ok(self)
	}

	/// Builder-style [`Record::set`].
	pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self, Error> {
		self.set(field, value)?;
		Ok(self)
	}

	/// Get a field. Fails for undeclared fields; unset fields are
	/// [`Value::Null`].
	pub fn get(&self, field: &str) -> Result<&Value, Error> {
		let field = self.model.field(field)?;
		Ok(self.value(&field.name))
	}

	/// The value of a field known to be declared.
	pub(crate) fn value(&self, name: &str) -> &Value {
		self.values.get(name).unwrap_or(&NULL)
	}

	/// The primary key value
	#[must_use]
	pub fn pk(&self) -> &Value {
		self.value(self.model.primary_key().name())
	}

	/// DN of the entry
	#[must_use]
	pub fn dn(&self) -> Option<&str> {
		self.dn.as_deref()
	}

	/// Replace the DN
	pub(crate) fn set_dn(&mut self, dn: String) {
		self.dn = Some(dn);
	}

	/// The model the record belongs to
	#[must_use]
	pub fn model(&self) -> &Arc<Model> {
		&self.model
	}
}
