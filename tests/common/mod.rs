//! An in-memory directory server speaking the crate's [`Directory`] trait.
//!
//! The fake evaluates filter trees itself and understands the paged results,
//! server side sorting and virtual list view controls through the crate's own
//! codecs, but only the ones it was told to advertise.
#![allow(dead_code)]

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use ldap3::{controls::RawControl, Scope, SearchEntry};
use ldap_query::{
	config::EndpointConfig,
	connection::{Connector, Directory, Role, SearchRequest, SearchResponse},
	controls::{
		PagedResults, SortRequest, SortResponse, VlvRequest, VlvResponse, VlvTarget,
		PAGED_RESULTS_OID, SORT_REQUEST_OID, VLV_REQUEST_OID,
	},
	filter::{Filter, Operator, Predicate},
	modlist::Change,
	Config, Error, SearchEntryExt, Value,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub const BASE_DN: &str = "ou=people,dc=example,dc=com";

/// Install a subscriber once for the whole test binary
pub fn init_tracing() {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_filter).with_test_writer().try_init();
}

/// A configuration with one profile named `default` pointing nowhere
pub fn config() -> Config {
	serde_json::from_str(&format!(
		r#"{{
			"servers": {{
				"default": {{
					"base_dn": "{BASE_DN}",
					"read": {{ "url": "ldap://read.invalid", "bind_dn": "cn=reader", "password": "r" }},
					"write": {{ "url": "ldap://write.invalid", "bind_dn": "cn=writer", "password": "w" }}
				}}
			}},
			"paging": {{ "default_page_size": 10, "min_page_size": 1, "max_page_size": 100 }}
		}}"#
	))
	.unwrap()
}

/// A search as the server saw it
#[derive(Clone, Debug)]
pub struct RecordedSearch {
	pub base: String,
	pub filter: String,
	pub attributes: Vec<String>,
	pub controls: Vec<String>,
	pub size_limit: i32,
}

/// A write as the server saw it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedWrite {
	Add(String),
	Modify(String, Vec<Change>),
	Delete(String),
	Rename { dn: String, new_rdn: String, new_superior: Option<String> },
}

/// State shared by all handles of a fake server
#[derive(Debug, Default)]
pub struct FakeServer {
	pub entries: Vec<SearchEntry>,
	/// Control OIDs advertised and honoured
	pub supported_controls: Vec<&'static str>,
	pub vendor: Option<String>,
	/// Delay before answering a root DSE read
	pub probe_delay: Duration,
	/// Result code to refuse virtual list view requests with
	pub refuse_vlv: Option<u32>,
	/// Advertise server side sorting but answer every sort request with
	/// unwillingToPerform
	pub failing_sort: bool,
	/// Fail every search with a transport error
	pub broken: bool,
	pub root_dse_reads: usize,
	pub searches: Vec<RecordedSearch>,
	pub writes: Vec<RecordedWrite>,
	pub connects: Vec<Role>,
	/// Principals of successful binds
	pub binds: Vec<String>,
}

impl FakeServer {
	pub fn with_controls(controls: &[&'static str]) -> Arc<Mutex<Self>> {
		Arc::new(Mutex::new(Self {
			supported_controls: controls.to_vec(),
			vendor: Some("OpenLDAP Foundation".to_owned()),
			..Self::default()
		}))
	}

	pub fn full() -> Arc<Mutex<Self>> {
		Self::with_controls(&[PAGED_RESULTS_OID, SORT_REQUEST_OID, VLV_REQUEST_OID])
	}

	pub fn bare() -> Arc<Mutex<Self>> {
		Self::with_controls(&[])
	}

	/// Add a person below [`BASE_DN`]
	pub fn person(&mut self, uid: &str, cn: &str, number: i64) {
		self.entries.push(entry(
			&format!("uid={uid},{BASE_DN}"),
			&[
				("objectClass", &["top", "inetOrgPerson"]),
				("uid", &[uid]),
				("cn", &[cn]),
				("uidNumber", &[&number.to_string()]),
			],
		));
	}

	/// Searches other than root DSE reads
	pub fn entry_searches(&self) -> Vec<RecordedSearch> {
		self.searches.iter().filter(|search| !search.base.is_empty()).cloned().collect()
	}

	fn root_dse(&self) -> SearchEntry {
		let mut attributes: Vec<(&str, Vec<&str>)> =
			vec![("supportedControl", self.supported_controls.clone())];
		if let Some(vendor) = &self.vendor {
			attributes.push(("vendorName", vec![vendor.as_str()]));
		}
		SearchEntry {
			dn: String::new(),
			attrs: attributes
				.into_iter()
				.map(|(name, values)| {
					(name.to_owned(), values.into_iter().map(str::to_owned).collect())
				})
				.collect(),
			bin_attrs: HashMap::new(),
		}
	}

	fn supports(&self, oid: &str) -> bool {
		self.supported_controls.iter().any(|supported| *supported == oid)
	}

	fn position(&self, dn: &str) -> Option<usize> {
		self.entries.iter().position(|entry| entry.dn.eq_ignore_ascii_case(dn))
	}

	fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, Error> {
		self.searches.push(RecordedSearch {
			base: request.base.clone(),
			filter: request.filter.render(&request.flavor),
			attributes: request.attributes.clone(),
			controls: request.controls.iter().map(|control| control.ctype.clone()).collect(),
			size_limit: request.size_limit,
		});
		if request.base.is_empty() && matches!(request.scope, Scope::Base) {
			self.root_dse_reads += 1;
			return Ok(SearchResponse { entries: vec![self.root_dse()], ..SearchResponse::default() });
		}
		for control in &request.controls {
			if control.crit && !self.supports(&control.ctype) {
				return Err(rejected(12, "Critical extension is unavailable"));
			}
		}

		let mut matched = match request.scope {
			Scope::Base => match self.position(&request.base) {
				Some(index) => vec![self.entries[index].clone()],
				None => return Err(rejected(32, "No such object")),
			},
			_ => self
				.entries
				.iter()
				.filter(|entry| {
					entry.dn.to_lowercase().ends_with(&request.base.to_lowercase())
				})
				.cloned()
				.collect(),
		};
		matched.retain(|entry| matches(&request.filter, entry));

		let mut response = SearchResponse::default();
		if let (Some(raw), true) =
			(find(&request.controls, SORT_REQUEST_OID), self.supports(SORT_REQUEST_OID))
		{
			let sort = SortRequest::decode(raw)?;
			if self.failing_sort {
				response.controls.push(SortResponse { result: 53, attribute: None }.to_control()?);
			} else {
				matched.sort_by(|a, b| {
					sort.keys
						.iter()
						.map(|key| {
							let order = sort_value(a, &key.attribute).cmp(&sort_value(b, &key.attribute));
							if key.reverse {
								order.reverse()
							} else {
								order
							}
						})
						.find(|order| order.is_ne())
						.unwrap_or(std::cmp::Ordering::Equal)
				});
				response.controls.push(SortResponse { result: 0, attribute: None }.to_control()?);
			}
		}

		if let Some(raw) = find(&request.controls, VLV_REQUEST_OID) {
			if let Some(code) = self.refuse_vlv {
				return Err(rejected(code, "Virtual list view refused"));
			}
			let vlv = VlvRequest::decode(raw)?;
			let count = matched.len();
			let VlvTarget::ByOffset { offset, .. } = vlv.target else {
				panic!("only offset targets are used");
			};
			let offset = usize::try_from(offset).unwrap();
			let (result, window) = if offset == 0 || offset > count {
				(61, Vec::new())
			} else {
				let first = (offset - 1).saturating_sub(usize::try_from(vlv.before_count).unwrap());
				let last = (offset + usize::try_from(vlv.after_count).unwrap()).min(count);
				(0, matched[first..last].to_vec())
			};
			matched = window;
			response.controls.push(
				VlvResponse {
					target_position: i32::try_from(offset.min(count)).unwrap(),
					content_count: i32::try_from(count).unwrap(),
					result,
					context_id: Some(b"ctx".to_vec()),
				}
				.to_control()?,
			);
		} else if let Some(raw) = find(&request.controls, PAGED_RESULTS_OID) {
			let paged = PagedResults::decode(raw)?;
			let start = if paged.cookie.is_empty() {
				0
			} else {
				String::from_utf8(paged.cookie).unwrap().parse::<usize>().unwrap()
			};
			let stop = (start + usize::try_from(paged.size).unwrap()).min(matched.len());
			let cookie = if stop < matched.len() { stop.to_string().into_bytes() } else { Vec::new() };
			matched = matched[start.min(stop)..stop].to_vec();
			response.controls.push(PagedResults { size: 0, cookie }.to_control()?);
		}

		if request.size_limit > 0 && matched.len() > usize::try_from(request.size_limit).unwrap() {
			matched.truncate(usize::try_from(request.size_limit).unwrap());
			response.code = 4;
		}
		response.entries = matched.iter().map(|entry| project(entry, &request.attributes)).collect();
		Ok(response)
	}

	fn apply(&mut self, dn: &str, changes: &[Change]) -> Result<(), Error> {
		let index = self.position(dn).ok_or_else(|| rejected(32, "No such object"))?;
		let entry = &mut self.entries[index];
		for change in changes {
			match change {
				Change::Add { attribute, values } | Change::Replace { attribute, values } => {
					entry.attrs.insert(
						attribute.clone(),
						values.iter().map(|value| String::from_utf8_lossy(value).into_owned()).collect(),
					);
				}
				Change::Delete { attribute } => {
					entry.attrs.remove(attribute);
				}
			}
		}
		Ok(())
	}
}

/// A handle onto a [`FakeServer`]
#[derive(Debug)]
pub struct FakeDirectory {
	server: Arc<Mutex<FakeServer>>,
}

#[async_trait]
impl Directory for FakeDirectory {
	async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, Error> {
		let (broken, delay) = {
			let server = self.server.lock().unwrap();
			(server.broken, server.probe_delay)
		};
		if broken {
			return Err(transport());
		}
		if request.base.is_empty() && !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		self.server.lock().unwrap().search(request)
	}

	async fn add(
		&mut self,
		dn: &str,
		attributes: Vec<(String, HashSet<Vec<u8>>)>,
	) -> Result<(), Error> {
		let mut server = self.server.lock().unwrap();
		if server.position(dn).is_some() {
			return Err(rejected(68, "Entry already exists"));
		}
		server.entries.push(SearchEntry {
			dn: dn.to_owned(),
			attrs: attributes
				.into_iter()
				.map(|(name, values)| {
					let mut values = values
						.into_iter()
						.map(|value| String::from_utf8_lossy(&value).into_owned())
						.collect::<Vec<_>>();
					values.sort();
					(name, values)
				})
				.collect(),
			bin_attrs: HashMap::new(),
		});
		server.writes.push(RecordedWrite::Add(dn.to_owned()));
		Ok(())
	}

	async fn modify(&mut self, dn: &str, changes: Vec<Change>) -> Result<(), Error> {
		let mut server = self.server.lock().unwrap();
		server.apply(dn, &changes)?;
		server.writes.push(RecordedWrite::Modify(dn.to_owned(), changes));
		Ok(())
	}

	async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		let mut server = self.server.lock().unwrap();
		let index = server.position(dn).ok_or_else(|| rejected(32, "No such object"))?;
		server.entries.remove(index);
		server.writes.push(RecordedWrite::Delete(dn.to_owned()));
		Ok(())
	}

	async fn rename(
		&mut self,
		dn: &str,
		new_rdn: &str,
		new_superior: Option<&str>,
	) -> Result<(), Error> {
		let mut server = self.server.lock().unwrap();
		let index = server.position(dn).ok_or_else(|| rejected(32, "No such object"))?;
		let parent = match new_superior {
			Some(parent) => parent.to_owned(),
			None => dn.split_once(',').map(|(_, parent)| parent.to_owned()).unwrap_or_default(),
		};
		let entry = &mut server.entries[index];
		entry.dn = format!("{new_rdn},{parent}");
		if let Some((attribute, value)) = new_rdn.split_once('=') {
			entry.attrs.insert(attribute.to_owned(), vec![value.to_owned()]);
		}
		server.writes.push(RecordedWrite::Rename {
			dn: dn.to_owned(),
			new_rdn: new_rdn.to_owned(),
			new_superior: new_superior.map(str::to_owned),
		});
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), Error> {
		Ok(())
	}
}

/// Hands out [`FakeDirectory`] handles onto one server
#[derive(Debug, Clone)]
pub struct FakeConnector {
	pub server: Arc<Mutex<FakeServer>>,
}

#[async_trait]
impl Connector for FakeConnector {
	async fn connect(
		&self,
		_profile: &str,
		role: Role,
		endpoint: &EndpointConfig,
	) -> Result<Box<dyn Directory>, Error> {
		endpoint.credential()?;
		let mut server = self.server.lock().unwrap();
		// Entries with a userPassword can be bound as; anything else is a
		// service account and accepted
		if let Some(index) = server.position(&endpoint.bind_dn) {
			let accepted = server.entries[index]
				.attrs
				.get("userPassword")
				.is_some_and(|passwords| {
					passwords.iter().any(|password| Some(password.as_str()) == endpoint.password.as_deref())
				});
			if !accepted {
				return Err(Error::Authentication {
					principal: endpoint.bind_dn.clone(),
					code: 49,
					message: "Invalid credentials".to_owned(),
				});
			}
		}
		server.connects.push(role);
		server.binds.push(endpoint.bind_dn.clone());
		Ok(Box::new(FakeDirectory { server: Arc::clone(&self.server) }))
	}
}

pub fn entry(dn: &str, attributes: &[(&str, &[&str])]) -> SearchEntry {
	SearchEntry {
		dn: dn.to_owned(),
		attrs: attributes
			.iter()
			.map(|(name, values)| {
				((*name).to_owned(), values.iter().map(|value| (*value).to_owned()).collect())
			})
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

fn rejected(code: u32, message: &str) -> Error {
	Error::Protocol(ldap_query::error::ProtocolError::Rejected {
		operation: "search",
		code,
		message: message.to_owned(),
	})
}

fn transport() -> Error {
	Error::Transport(ldap3::LdapError::from(std::io::Error::new(
		std::io::ErrorKind::ConnectionReset,
		"connection reset by peer",
	)))
}

fn find<'a>(controls: &'a [RawControl], oid: &str) -> Option<&'a [u8]> {
	controls.iter().find(|control| control.ctype == oid).and_then(|control| control.val.as_deref())
}

/// Key used to sort entries: numbers numerically, anything else as lowercase
/// text
fn sort_value(entry: &SearchEntry, attribute: &str) -> (Option<i64>, String) {
	let value = entry
		.attr_values(attribute)
		.first()
		.map(|raw| String::from_utf8_lossy(raw).to_lowercase())
		.unwrap_or_default();
	(value.parse().ok(), value)
}

/// Keep only the requested attributes
fn project(entry: &SearchEntry, attributes: &[String]) -> SearchEntry {
	let wanted = |name: &str| {
		attributes.is_empty()
			|| attributes.iter().any(|attribute| attribute == "*" || attribute.eq_ignore_ascii_case(name))
	};
	SearchEntry {
		dn: entry.dn.clone(),
		attrs: entry
			.attrs
			.iter()
			.filter(|(name, _)| wanted(name))
			.map(|(name, values)| (name.clone(), values.clone()))
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

/// Evaluate a filter tree against an entry, comparing case-insensitively
pub fn matches(filter: &Filter, entry: &SearchEntry) -> bool {
	match filter {
		Filter::And(children) => children.iter().all(|child| matches(child, entry)),
		Filter::Or(children) => children.iter().any(|child| matches(child, entry)),
		Filter::Predicate(predicate) => matches_predicate(predicate, entry),
	}
}

fn matches_predicate(predicate: &Predicate, entry: &SearchEntry) -> bool {
	let present = entry
		.attr_values(predicate.attribute())
		.into_iter()
		.map(|raw| String::from_utf8_lossy(raw).to_lowercase())
		.collect::<Vec<_>>();
	let texts = |value: &Value| -> Vec<String> {
		match value {
			Value::Null => Vec::new(),
			Value::Text(text) => vec![text.to_lowercase()],
			Value::TextList(list) => list.iter().map(|text| text.to_lowercase()).collect(),
			Value::Integer(number) => vec![number.to_string()],
			Value::Boolean(flag) => vec![flag.to_string()],
			other => panic!("unsupported assertion value {other:?}"),
		}
	};
	let numbers = || present.iter().filter_map(|value| value.parse::<i64>().ok()).collect::<Vec<_>>();
	let bound = || predicate.values().first().and_then(Value::as_integer).unwrap();
	let substring = |test: fn(&str, &str) -> bool| {
		let needle = predicate.values().first().map(&texts).unwrap_or_default();
		let needle = needle.first().map_or("", String::as_str);
		present.iter().any(|value| test(value, needle))
	};

	match predicate.operator() {
		Operator::Equals | Operator::IEquals => match predicate.values().first() {
			Some(Value::Null) | None => present.is_empty(),
			Some(value) => {
				let wanted = texts(value);
				!wanted.is_empty() && wanted.iter().all(|value| present.contains(value))
			}
		},
		Operator::In => predicate.values().iter().flat_map(&texts).any(|value| present.contains(&value)),
		Operator::Contains => substring(|value, needle| value.contains(needle)),
		Operator::StartsWith => substring(|value, needle| value.starts_with(needle)),
		Operator::EndsWith => substring(|value, needle| value.ends_with(needle)),
		Operator::Gt => numbers().iter().any(|value| *value > bound()),
		Operator::Gte => numbers().iter().any(|value| *value >= bound()),
		Operator::Lt => numbers().iter().any(|value| *value < bound()),
		Operator::Lte => numbers().iter().any(|value| *value <= bound()),
		Operator::Exists => match predicate.values().first() {
			Some(Value::Boolean(false)) => present.is_empty(),
			_ => !present.is_empty(),
		},
	}
}

/// A connected registry and the server behind it
pub fn registry(server: &Arc<Mutex<FakeServer>>, config: &Arc<Config>) -> ldap_query::ConnectionRegistry {
	ldap_query::ConnectionRegistry::new(
		Arc::clone(config),
		Arc::new(FakeConnector { server: Arc::clone(server) }),
	)
}

/// Connect to the OpenLDAP container used by the ignored tests
pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn std::error::Error>> {
	let (conn, mut ldap) = ldap3::LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?.success()?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn std::error::Error>> {
	ldap.add(
		&format!("ou={ou},dc=example,dc=org"),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn std::error::Error>> {
	ldap.delete(&format!("ou={ou},dc=example,dc=org")).await?.success()?;
	Ok(())
}

pub async fn ldap_search_user(
	ldap: &mut ldap3::Ldap,
	cn: &str,
) -> Result<SearchEntry, Box<dyn std::error::Error>> {
	let (result, _res) = ldap
		.search(
			&format!("cn={cn},ou=users,dc=example,dc=org"),
			Scope::Base,
			"(objectClass=inetOrgPerson)",
			vec!["*"],
		)
		.await?
		.success()?;
	let entry = result.first().ok_or("No entry found")?.clone();
	Ok(SearchEntry::construct(entry))
}
