//! Running queries and writing entries.
//!
//! A [`Manager`] ties a [`Model`] to its server profile and base DN. Queries
//! start from [`Manager::all`] and run when one of the terminal operations of
//! [`QuerySet`] is awaited. Every terminal operation takes the caller's
//! [`ConnectionRegistry`]: reads go through the profile's read endpoint,
//! writes through its write endpoint.
//!
//! Slicing has a deliberate asymmetry. A prefix `[..stop]` is always served
//! with a bounded fetch when the server can page. A slice with a non-zero
//! start, or with a step, is only efficient when the server supports the
//! virtual list view; otherwise the whole result is fetched and sliced on the
//! client.
use std::{
	collections::{BTreeMap, VecDeque},
	sync::Arc,
};

use ldap3::{controls::RawControl, Scope, SearchEntry};
use tracing::{debug, info, warn};

use crate::{
	capabilities::{Capabilities, CapabilityCache, Flavor},
	config::Config,
	connection::{ConnectionRegistry, Role, SearchRequest, SearchResponse},
	controls::{
		self, PagedResults, SortRequest, SortRequestKey, SortResponse, VlvRequest, VlvResponse,
		PAGED_RESULTS_OID, SORT_RESPONSE_OID, VLV_RESPONSE_OID,
	},
	cursor::Cursor,
	entry::SearchEntryExt,
	error::Error,
	filter::Filter,
	model::{Model, Record, SortKey, Value},
	modlist,
	query::{Projection, Query, QuerySet, Slice},
	strategy::{self, PageStrategy, Strategy},
};

/// Result codes after which a virtual list view request is retried on the
/// client: operationsError, unavailableCriticalExtension, unwillingToPerform
/// and virtualListViewError
const VLV_FALLBACK_CODES: [u32; 4] = [1, 12, 53, 76];

/// Result code for a base object that does not exist
const NO_SUCH_OBJECT: u32 = 32;

/// virtualListViewResult for a target offset outside the content count
const OFFSET_RANGE_ERROR: i32 = 61;

/// The entry point for queries and writes of one model.
#[derive(Clone, Debug)]
pub struct Manager {
	/// The model managed
	model: Arc<Model>,
	/// Server profiles and paging bounds
	config: Arc<Config>,
	/// Where the model's entries live
	base_dn: String,
	/// Where capability records are cached
	cache: Arc<CapabilityCache>,
}

/// One page of a paginated listing.
#[derive(Clone, Debug)]
pub struct Page {
	/// The entries of this page
	pub records: Vec<Record>,
	/// Whether another page follows
	pub has_more: bool,
	/// Cursor for the next page, if there is one
	pub next_cursor: Option<String>,
}

impl Manager {
	/// Create a manager for a model. The model's server profile must exist and
	/// be valid, the paging bounds must be consistent, and either the model or
	/// the profile must define a base DN.
	pub fn new(model: Arc<Model>, config: Arc<Config>) -> Result<Self, Error> {
		config.paging.validate()?;
		let profile = config.profile(model.server())?;
		profile.read.validate(model.server())?;
		profile.write.validate(model.server())?;
		let base_dn = model
			.base_dn()
			.or(profile.base_dn.as_deref())
			.ok_or_else(|| {
				Error::Configuration(format!(
					"{}: no base DN on the model or on profile '{}'",
					model.name(),
					model.server()
				))
			})?
			.to_owned();
		Ok(Self { model, config, base_dn, cache: CapabilityCache::global() })
	}

	/// Use a different capability cache than the process-wide one.
	#[must_use]
	pub fn with_cache(mut self, cache: Arc<CapabilityCache>) -> Self {
		self.cache = cache;
		self
	}

	/// The model managed
	#[must_use]
	pub fn model(&self) -> &Arc<Model> {
		&self.model
	}

	/// Where the model's entries live
	#[must_use]
	pub fn base_dn(&self) -> &str {
		&self.base_dn
	}

	/// Name of the server profile
	#[must_use]
	pub fn profile(&self) -> &str {
		self.model.server()
	}

	/// The capability cache in use
	#[must_use]
	pub fn cache(&self) -> &Arc<CapabilityCache> {
		&self.cache
	}

	/// A query for all entries of the model.
	#[must_use]
	pub fn all(&self) -> QuerySet {
		QuerySet::new(self.clone())
	}

	/// Shorthand for `all().filter(..)`.
	pub fn filter(&self, lookup: &str, value: impl Into<Value>) -> Result<QuerySet, Error> {
		self.all().filter(lookup, value)
	}

	/// A new, empty record of the model.
	#[must_use]
	pub fn record(&self) -> Record {
		Record::new(&self.model)
	}

	/// The capabilities of the model's server, probing it on first use.
	pub async fn capabilities(
		&self,
		registry: &mut ConnectionRegistry,
	) -> Result<Arc<Capabilities>, Error> {
		let directory = registry.get(self.profile(), Role::Read).await?;
		self.cache.get_or_detect(self.profile(), &self.config.paging, directory).await
	}

	/// Read an entry by primary key. The DN is built from the base DN and the
	/// key, and read directly with a base search, which is cheaper than
	/// filtering for the key.
	pub async fn get_by_pk(
		&self,
		registry: &mut ConnectionRegistry,
		pk: impl Into<Value>,
	) -> Result<Record, Error> {
		let dn = self.model.dn_for(&pk.into(), &self.base_dn)?;
		self.read(registry, &dn).await
	}

	/// Read an entry by DN. DNs outside the manager's base DN are refused
	/// without asking the server.
	pub async fn get_by_dn(&self, registry: &mut ConnectionRegistry, dn: &str) -> Result<Record, Error> {
		if !is_below(dn, &self.base_dn) {
			return Err(Error::Configuration(format!(
				"'{dn}' is not below the base DN '{}' of {}",
				self.base_dn,
				self.model.name()
			)));
		}
		self.read(registry, dn).await
	}

	/// Check a password by binding as the user with the given primary key.
	/// Unknown users and refused binds both give `false`; an empty password
	/// is refused before anything is sent, as servers treat it as an
	/// anonymous bind.
	pub async fn authenticate(
		&self,
		registry: &mut ConnectionRegistry,
		username: &str,
		password: &str,
	) -> Result<bool, Error> {
		if password.is_empty() {
			warn!(user = username, "Refusing to authenticate with an empty password");
			return Ok(false);
		}
		let pk = self.model.primary_key().name();
		let user = match self.filter(pk, username)?.only(&[pk])?.get(registry).await {
			Ok(user) => user,
			Err(Error::NotFound) => {
				warn!(user = username, "Authentication failed: no such user");
				return Ok(false);
			}
			Err(err) => return Err(err),
		};
		let dn = user.dn().ok_or_else(|| Error::Missing(format!("DN of user {username}")))?;
		match registry.bind_as(self.profile(), dn, password).await {
			Ok(mut handle) => {
				if let Err(err) = handle.unbind().await {
					warn!(user = username, "Unbind after authentication failed: {err}");
				}
				info!(user = username, "Authenticated");
				Ok(true)
			}
			Err(Error::Authentication { code, .. }) => {
				warn!(user = username, code, "Authentication failed: invalid credentials");
				Ok(false)
			}
			Err(err) => Err(err),
		}
	}

	/// Base search on a single DN
	async fn read(&self, registry: &mut ConnectionRegistry, dn: &str) -> Result<Record, Error> {
		let mut request = self.request(&Filter::default(), Flavor::Unknown, self.model.attributes());
		dn.clone_into(&mut request.base);
		request.scope = Scope::Base;
		let directory = registry.get(self.profile(), Role::Read).await?;
		let response = match directory.search(&request).await {
			Err(err) if err.result_code() == Some(NO_SUCH_OBJECT) => return Err(Error::NotFound),
			other => other?,
		};
		let entry = response.entries.first().ok_or(Error::NotFound)?;
		self.model.decode(entry, None)
	}

	/// Add a new entry. Returns the record with its DN set.
	pub async fn create(
		&self,
		registry: &mut ConnectionRegistry,
		record: &Record,
	) -> Result<Record, Error> {
		self.check_model(record)?;
		let capabilities = self.capabilities(registry).await?;
		let dn = self.model.dn_for(record.pk(), &self.base_dn)?;
		let attributes = self.model.add_attributes(record, &capabilities.flavor)?;
		registry.get(self.profile(), Role::Write).await?.add(&dn, attributes).await?;
		debug!(%dn, "Created entry");
		let mut created = record.clone();
		created.set_dn(dn);
		Ok(created)
	}

	/// Write the difference between two snapshots of an entry. Only changed
	/// attributes are sent. A changed primary key renames the entry first.
	pub async fn modify(
		&self,
		registry: &mut ConnectionRegistry,
		old: &Record,
		new: &Record,
	) -> Result<Record, Error> {
		self.check_model(old)?;
		self.check_model(new)?;
		let capabilities = self.capabilities(registry).await?;
		let changes = modlist::diff(&self.model, old, new, &capabilities.flavor)?;
		let mut dn = match old.dn() {
			Some(dn) => dn.to_owned(),
			None => self.model.dn_for(old.pk(), &self.base_dn)?,
		};

		let writer = registry.get(self.profile(), Role::Write).await?;
		if new.pk() != old.pk() {
			let (_, parent) = split_dn(&dn);
			let new_dn = self.model.dn_for(new.pk(), parent)?;
			let (new_rdn, _) = split_dn(&new_dn);
			writer.rename(&dn, new_rdn, None).await?;
			debug!(old = %dn, new = %new_dn, "Renamed entry");
			dn = new_dn;
		}
		if changes.is_empty() {
			debug!(%dn, "No attribute changes to write");
		} else {
			let attributes = changes.iter().map(modlist::Change::attribute).collect::<Vec<_>>();
			debug!(%dn, ?attributes, "Modifying entry");
			writer.modify(&dn, changes).await?;
		}

		let mut updated = new.clone();
		updated.set_dn(dn);
		Ok(updated)
	}

	/// Delete the entry a record was read from.
	pub async fn delete(&self, registry: &mut ConnectionRegistry, record: &Record) -> Result<(), Error> {
		self.check_model(record)?;
		let dn = match record.dn() {
			Some(dn) => dn.to_owned(),
			None => self.model.dn_for(record.pk(), &self.base_dn)?,
		};
		registry.get(self.profile(), Role::Write).await?.delete(&dn).await?;
		debug!(%dn, "Deleted entry");
		Ok(())
	}

	/// Move an entry to a new DN. The new superior is only sent when the
	/// parent changes.
	pub async fn rename(
		&self,
		registry: &mut ConnectionRegistry,
		old_dn: &str,
		new_dn: &str,
	) -> Result<(), Error> {
		let (old_rdn, old_parent) = split_dn(old_dn);
		let (new_rdn, new_parent) = split_dn(new_dn);
		if new_rdn.is_empty() {
			return Err(Error::Configuration(format!("'{new_dn}' is not a valid DN")));
		}
		let superior = (!new_parent.eq_ignore_ascii_case(old_parent)).then_some(new_parent);
		if superior.is_none() && new_rdn == old_rdn {
			debug!(dn = old_dn, "Rename to the same DN skipped");
			return Ok(());
		}
		registry.get(self.profile(), Role::Write).await?.rename(old_dn, new_rdn, superior).await
	}

	/// Build a subtree search below the base DN, restricted to the model's
	/// object class.
	fn request(&self, filter: &Filter, flavor: Flavor, attributes: Vec<String>) -> SearchRequest {
		let filter = match self.model.object_class() {
			Some(object_class) => Filter::and([Filter::object_class(object_class), filter.clone()]),
			None => filter.clone(),
		};
		SearchRequest::subtree(&self.base_dn, filter, flavor, attributes)
	}

	/// Refuse records of other models
	fn check_model(&self, record: &Record) -> Result<(), Error> {
		if Arc::ptr_eq(record.model(), &self.model) {
			Ok(())
		} else {
			Err(Error::Configuration(format!(
				"Record of model {} passed to the manager of {}",
				record.model().name(),
				self.model.name()
			)))
		}
	}
}

impl QuerySet {
	/// Start iterating. Entries are fetched lazily, a page at a time.
	pub async fn iterate<'a>(
		&self,
		registry: &'a mut ConnectionRegistry,
	) -> Result<QueryStream<'a>, Error> {
		self.open(registry, self.attributes(), None).await
	}

	/// Fetch all matching records.
	pub async fn list(&self, registry: &mut ConnectionRegistry) -> Result<Vec<Record>, Error> {
		self.iterate(registry).await?.collect().await
	}

	/// Count matching entries without transferring their attributes.
	pub async fn count(&self, registry: &mut ConnectionRegistry) -> Result<usize, Error> {
		let mut counted = self.clone();
		if counted.query.slice.is_none() {
			counted.query.ordering.clear();
		}
		let attributes = if counted.query.ordering.is_empty() {
			vec!["1.1".to_owned()]
		} else {
			counted.query.ordering.iter().map(|key| key.attribute.clone()).collect()
		};
		let mut stream = counted.open(registry, attributes, None).await?;
		let mut count = 0;
		while stream.next_entry().await?.is_some() {
			count += 1;
		}
		Ok(count)
	}

	/// Whether any entry matches.
	pub async fn exists(&self, registry: &mut ConnectionRegistry) -> Result<bool, Error> {
		if self.query.slice.is_some() {
			return Ok(self.count(registry).await? > 0);
		}
		Ok(!self.probe(registry, 1, vec!["1.1".to_owned()]).await?.is_empty())
	}

	/// The first matching record, if any. Without an ordering this asks the
	/// server for a single entry.
	pub async fn first(&self, registry: &mut ConnectionRegistry) -> Result<Option<Record>, Error> {
		if self.query.ordering.is_empty() && self.query.slice.is_none() {
			let entries = self.probe(registry, 1, self.attributes()).await?;
			return entries.first().map(|entry| self.decode(entry)).transpose();
		}
		self.leading(1)?.iterate(registry).await?.next().await
	}

	/// The single matching record. Fails with [`Error::NotFound`] if nothing
	/// matches and with [`Error::MultipleMatches`] if more than one entry
	/// does.
	pub async fn get(&self, registry: &mut ConnectionRegistry) -> Result<Record, Error> {
		let mut entries = if self.query.slice.is_none() {
			self.probe(registry, 2, self.attributes()).await?
		} else {
			let mut stream = self.leading(2)?.iterate(registry).await?;
			let mut entries = Vec::new();
			while entries.len() < 2 {
				match stream.next_entry().await? {
					Some(entry) => entries.push(entry),
					None => break,
				}
			}
			entries
		};
		match entries.len() {
			0 => Err(Error::NotFound),
			1 => entries.pop().map_or(Err(Error::NotFound), |entry| self.decode(&entry)),
			_ => Err(Error::MultipleMatches),
		}
	}

	/// Set fields on the single matching entry and write the difference.
	/// Fails like [`QuerySet::get`] when the query does not match exactly one
	/// entry. Returns the updated record.
	pub async fn update<'f>(
		&self,
		registry: &mut ConnectionRegistry,
		fields: impl IntoIterator<Item = (&'f str, Value)>,
	) -> Result<Record, Error> {
		let mut whole = self.clone();
		whole.query.projection = Projection::All;
		let old = whole.get(registry).await?;
		let mut new = old.clone();
		for (field, value) in fields {
			new.set(field, value)?;
		}
		self.manager.modify(registry, &old, &new).await
	}

	/// Delete the single matching entry. Fails like [`QuerySet::get`] when
	/// the query does not match exactly one entry, so a broad filter can never
	/// delete more than intended.
	pub async fn delete(&self, registry: &mut ConnectionRegistry) -> Result<(), Error> {
		let record = self.get(registry).await?;
		self.manager.delete(registry, &record).await
	}

	/// Rows of field values, in the order of the fields given to
	/// [`QuerySet::values`].
	pub async fn values_list(
		&self,
		registry: &mut ConnectionRegistry,
	) -> Result<Vec<Vec<Value>>, Error> {
		let names = self.value_names();
		Ok(self
			.list(registry)
			.await?
			.iter()
			.map(|record| names.iter().map(|name| record.value(name).clone()).collect())
			.collect())
	}

	/// Rows of field values keyed by field name.
	pub async fn value_maps(
		&self,
		registry: &mut ConnectionRegistry,
	) -> Result<Vec<BTreeMap<String, Value>>, Error> {
		let names = self.value_names();
		Ok(self
			.list(registry)
			.await?
			.iter()
			.map(|record| {
				names.iter().map(|name| (name.clone(), record.value(name).clone())).collect()
			})
			.collect())
	}

	/// Fetch one page of the query, ignoring any slice. Pass the
	/// `next_cursor` of the previous page to continue; the cursor is only
	/// valid for the same query and page size.
	pub async fn page(
		&self,
		registry: &mut ConnectionRegistry,
		page_size: u32,
		cursor: Option<&str>,
	) -> Result<Page, Error> {
		let cursor = cursor.map(Cursor::decode).transpose()?;
		let capabilities = self.manager.capabilities(registry).await?;
		let size = self.manager.config.paging.clamp(page_size).min(capabilities.page_size.max(1));
		match strategy::select_page(&self.query, &capabilities, cursor.as_ref())? {
			PageStrategy::Paged { sorted } => {
				let cookie = match cursor {
					Some(Cursor::Paged { cookie }) => cookie,
					_ => Vec::new(),
				};
				self.page_paged(registry, &capabilities, size, cookie, sorted).await
			}
			PageStrategy::Vlv => {
				let (offset, content_count, context_id) = match cursor {
					Some(Cursor::Vlv { context_id, offset, content_count }) => {
						(offset, content_count, context_id)
					}
					_ => (0, 0, None),
				};
				self.page_vlv(registry, &capabilities, size, offset, content_count, context_id).await
			}
			PageStrategy::Offset => {
				let offset = match cursor {
					// An earlier fallback was already reported
					Some(Cursor::Offset { offset }) => offset,
					_ => {
						self.manager.cache.note_degradation(
							self.manager.profile(),
							&format!("page {}", self.query.shape()),
							"the server can neither page nor sort this query",
						);
						0
					}
				};
				self.page_offset(registry, size, offset).await
			}
		}
	}

	/// A page through simple paged results
	async fn page_paged(
		&self,
		registry: &mut ConnectionRegistry,
		capabilities: &Capabilities,
		size: u32,
		cookie: Vec<u8>,
		sorted: bool,
	) -> Result<Page, Error> {
		let first_page = cookie.is_empty();
		let mut controls = vec![PagedResults { size: page_size_i32(size), cookie }.to_control()?];
		if sorted {
			controls.push(sort_control(&self.query.ordering)?);
		}
		let response = self.search(registry, capabilities, self.attributes(), controls).await?;
		if sorted && first_page && !sort_succeeded(&response.controls)? {
			self.manager.cache.note_degradation(
				self.manager.profile(),
				&format!("page {}", self.query.shape()),
				"the server failed to sort the page",
			);
			return self.page_offset(registry, size, 0).await;
		}
		let cookie = paged_cookie(&response.controls)?;
		let records = self.decode_all(&response.entries)?;
		let has_more = !cookie.is_empty();
		let next_cursor = if has_more { Some(Cursor::Paged { cookie }.encode()?) } else { None };
		Ok(Page { records, has_more, next_cursor })
	}

	/// A page through the virtual list view
	async fn page_vlv(
		&self,
		registry: &mut ConnectionRegistry,
		capabilities: &Capabilities,
		size: u32,
		offset: usize,
		content_count_hint: usize,
		context_id: Option<Vec<u8>>,
	) -> Result<Page, Error> {
		let size = usize::try_from(size).unwrap_or(usize::MAX);
		let window = VlvRequest::for_slice(offset, size, content_count_hint, context_id)?;
		let controls = vec![sort_control(&self.query.ordering)?, window.to_control()?];
		let response =
			match self.search(registry, capabilities, self.attributes(), controls).await {
				Err(err) if is_vlv_fallback(&err) => {
					self.manager.cache.note_degradation(
						self.manager.profile(),
						&format!("page {}", self.query.shape()),
						&format!("virtual list view rejected: {err}"),
					);
					return self.page_offset(registry, page_size_u32(size), offset).await;
				}
				other => other?,
			};
		let vlv = vlv_response(&response.controls)?;
		let content_count = usize::try_from(vlv.content_count).unwrap_or_default();
		if vlv.result == OFFSET_RANGE_ERROR || offset >= content_count {
			return Ok(Page { records: Vec::new(), has_more: false, next_cursor: None });
		}
		if vlv.result != 0 || !sort_succeeded(&response.controls)? {
			self.manager.cache.note_degradation(
				self.manager.profile(),
				&format!("page {}", self.query.shape()),
				"the server failed to serve the virtual list view",
			);
			return self.page_offset(registry, page_size_u32(size), offset).await;
		}
		let entries = response.entries.iter().take(size).cloned().collect::<Vec<_>>();
		let records = self.decode_all(&entries)?;
		let next_offset = offset + records.len();
		let has_more = next_offset < content_count;
		let next_cursor = if has_more {
			Some(
				Cursor::Vlv { context_id: vlv.context_id, offset: next_offset, content_count }
					.encode()?,
			)
		} else {
			None
		};
		Ok(Page { records, has_more, next_cursor })
	}

	/// A page cut out of the full result on the client
	async fn page_offset(
		&self,
		registry: &mut ConnectionRegistry,
		size: u32,
		offset: usize,
	) -> Result<Page, Error> {
		let size = usize::try_from(size).unwrap_or(usize::MAX);
		let mut window = self.clone();
		window.query.slice =
			Some(Slice { start: offset, stop: Some(offset.saturating_add(size).saturating_add(1)), step: 1 });
		let mut records = window
			.open(registry, self.attributes(), Some(Strategy::ClientEmulated { degraded: false }))
			.await?
			.collect()
			.await?;
		let has_more = records.len() > size;
		records.truncate(size);
		let next_cursor =
			if has_more { Some(Cursor::Offset { offset: offset + size }.encode()?) } else { None };
		Ok(Page { records, has_more, next_cursor })
	}

	/// The query narrowed to its first `count` results where that can be
	/// expressed as a slice. A stepped query is left as is; callers stop
	/// reading after `count` results instead.
	fn leading(&self, count: usize) -> Result<Self, Error> {
		match self.query.slice {
			Some(slice) if slice.step != 1 => Ok(self.clone()),
			_ => self.slice(..count),
		}
	}

	/// Open a stream with the given attributes, optionally forcing a strategy
	async fn open<'a>(
		&self,
		registry: &'a mut ConnectionRegistry,
		attributes: Vec<String>,
		forced: Option<Strategy>,
	) -> Result<QueryStream<'a>, Error> {
		let mut stream = QueryStream {
			registry,
			manager: self.manager.clone(),
			query: self.query.clone(),
			capabilities: Arc::new(Capabilities::none(&self.manager.config.paging)),
			attributes,
			strategy: Strategy::NoLimit,
			plan: Plan::Emulated,
			buffer: VecDeque::new(),
			position: 0,
			skip: 0,
			stop: None,
			step: 1,
			exhausted: false,
		};
		if self.query.slice.is_some_and(|slice| slice.is_empty()) {
			stream.exhausted = true;
			return Ok(stream);
		}
		let capabilities = self.manager.capabilities(stream.registry).await?;
		let strategy = match forced {
			Some(strategy) => strategy,
			None => strategy::select(&self.query, &capabilities)?,
		};
		debug!(profile = self.manager.profile(), ?strategy, "Executing query");
		stream.capabilities = capabilities;
		stream.start(strategy);
		Ok(stream)
	}

	/// A single search limited to `size_limit` entries
	async fn probe(
		&self,
		registry: &mut ConnectionRegistry,
		size_limit: i32,
		attributes: Vec<String>,
	) -> Result<Vec<SearchEntry>, Error> {
		let capabilities = self.manager.capabilities(registry).await?;
		let mut request =
			self.manager.request(&self.query.filter, capabilities.flavor.clone(), attributes);
		request.size_limit = size_limit;
		let directory = registry.get(self.manager.profile(), Role::Read).await?;
		Ok(directory.search(&request).await?.entries)
	}

	/// A single search with the given controls
	async fn search(
		&self,
		registry: &mut ConnectionRegistry,
		capabilities: &Capabilities,
		attributes: Vec<String>,
		controls: Vec<RawControl>,
	) -> Result<SearchResponse, Error> {
		let mut request =
			self.manager.request(&self.query.filter, capabilities.flavor.clone(), attributes);
		request.controls = controls;
		let directory = registry.get(self.manager.profile(), Role::Read).await?;
		directory.search(&request).await
	}

	/// Attributes to request: the projection, the primary key and the sort
	/// keys
	fn attributes(&self) -> Vec<String> {
		let model = &self.manager.model;
		let mut attributes = match &self.query.projection {
			Projection::All => return model.attributes(),
			Projection::Only(names) | Projection::Values(names) => names
				.iter()
				.filter_map(|name| model.field(name).ok())
				.map(|field| field.attribute_name().to_owned())
				.collect::<Vec<_>>(),
		};
		let extra = std::iter::once(model.primary_key().attribute_name().to_owned())
			.chain(self.query.ordering.iter().map(|key| key.attribute.clone()))
			.collect::<Vec<_>>();
		for attribute in extra {
			if !attributes.iter().any(|known| known.eq_ignore_ascii_case(&attribute)) {
				attributes.push(attribute);
			}
		}
		attributes
	}

	/// Field names of a value projection
	fn value_names(&self) -> Vec<String> {
		match &self.query.projection {
			Projection::Values(names) | Projection::Only(names) => names.clone(),
			Projection::All => {
				self.manager.model.fields().iter().map(|field| field.name().to_owned()).collect()
			}
		}
	}

	/// Decode an entry with the query's projection
	fn decode(&self, entry: &SearchEntry) -> Result<Record, Error> {
		decode(&self.manager.model, &self.query.projection, entry)
	}

	/// Decode several entries
	fn decode_all(&self, entries: &[SearchEntry]) -> Result<Vec<Record>, Error> {
		entries.iter().map(|entry| self.decode(entry)).collect()
	}
}

/// How a running stream fetches its next batch
#[derive(Clone, Debug)]
enum Plan {
	/// One search, optionally sorted by the server
	Single {
		/// Whether a sort control is sent
		sorted: bool,
	},
	/// Simple paged searches, optionally sorted by the server
	Paged {
		/// Entries per page
		page_size: u32,
		/// Cookie for the next page, empty for the first one
		cookie: Vec<u8>,
		/// Whether a sort control is sent
		sorted: bool,
	},
	/// One virtual list view window
	Window {
		/// First position, 0-based
		start: usize,
		/// Position after the last one
		stop: usize,
	},
	/// Everything at once, sorted on the client
	Emulated,
}

/// A running query. Each call to [`QueryStream::next`] returns a buffered
/// entry or, once the buffer runs dry, fetches the next batch from the
/// server. A stream cannot be rewound; run the query again instead.
#[derive(Debug)]
pub struct QueryStream<'a> {
	/// The execution context the stream reads through
	registry: &'a mut ConnectionRegistry,
	/// Manager of the queried model
	manager: Manager,
	/// The query being run
	query: Query,
	/// Capabilities of the server
	capabilities: Arc<Capabilities>,
	/// Attributes requested
	attributes: Vec<String>,
	/// The strategy chosen for the query
	strategy: Strategy,
	/// How the next batch is fetched
	plan: Plan,
	/// Entries fetched but not yet returned
	buffer: VecDeque<SearchEntry>,
	/// Position of the first buffered entry in the fetched result
	position: usize,
	/// Positions to skip on the client
	skip: usize,
	/// Position to stop at on the client
	stop: Option<usize>,
	/// Client side step
	step: usize,
	/// Whether the server has nothing more to send
	exhausted: bool,
}

impl QueryStream<'_> {
	/// The strategy the query runs with
	#[must_use]
	pub fn strategy(&self) -> Strategy {
		self.strategy
	}

	/// The next record, or `None` at the end.
	pub async fn next(&mut self) -> Result<Option<Record>, Error> {
		match self.next_entry().await? {
			Some(entry) => Ok(Some(decode(&self.manager.model, &self.query.projection, &entry)?)),
			None => Ok(None),
		}
	}

	/// Drain the stream.
	pub async fn collect(mut self) -> Result<Vec<Record>, Error> {
		let mut records = Vec::new();
		while let Some(record) = self.next().await? {
			records.push(record);
		}
		Ok(records)
	}

	/// The next raw entry inside the client side window
	pub(crate) async fn next_entry(&mut self) -> Result<Option<SearchEntry>, Error> {
		loop {
			while let Some(entry) = self.buffer.pop_front() {
				let position = self.position;
				self.position += 1;
				if self.stop.is_some_and(|stop| position >= stop) {
					self.finish();
					return Ok(None);
				}
				if position < self.skip || (position - self.skip) % self.step != 0 {
					continue;
				}
				return Ok(Some(entry));
			}
			if self.exhausted || self.stop.is_some_and(|stop| self.position >= stop) {
				self.finish();
				return Ok(None);
			}
			self.fetch().await?;
		}
	}

	/// Turn a strategy into a fetch plan and a client side window
	fn start(&mut self, strategy: Strategy) {
		self.strategy = strategy;
		let slice = self.query.slice.unwrap_or(Slice { start: 0, stop: None, step: 1 });
		self.skip = slice.start;
		self.stop = slice.stop;
		self.step = slice.step.max(1);
		let page_size = self.capabilities.page_size.max(1);
		self.plan = match strategy {
			Strategy::NoLimit if self.capabilities.paging => {
				Plan::Paged { page_size, cookie: Vec::new(), sorted: false }
			}
			Strategy::NoLimit => Plan::Single { sorted: false },
			Strategy::ServerPage { page_size, sorted, .. } => {
				Plan::Paged { page_size, cookie: Vec::new(), sorted }
			}
			Strategy::VirtualListSlice { start, stop } => {
				self.skip = 0;
				self.stop = Some(stop - start);
				Plan::Window { start, stop }
			}
			Strategy::ServerSort if self.capabilities.paging => {
				Plan::Paged { page_size, cookie: Vec::new(), sorted: true }
			}
			Strategy::ServerSort => Plan::Single { sorted: true },
			Strategy::ClientEmulated { degraded } => {
				if degraded {
					self.degrade("the server lacks the controls this query needs");
				}
				Plan::Emulated
			}
		};
	}

	/// Fetch the next batch. Each plan step is one round trip, except for
	/// client side emulation, which drains all pages at once.
	async fn fetch(&mut self) -> Result<(), Error> {
		match self.plan.clone() {
			Plan::Single { sorted } => {
				let mut controls = Vec::new();
				if sorted {
					controls.push(sort_control(&self.query.ordering)?);
				}
				let response = self.search(controls).await?;
				let mut entries = response.entries;
				if sorted && !sort_succeeded(&response.controls)? {
					self.degrade("the server failed to sort the result");
					sort_entries(&self.manager.model, &self.query.ordering, &mut entries);
				}
				self.buffer.extend(entries);
				self.exhausted = true;
			}
			Plan::Paged { page_size, cookie, sorted } => {
				let first_page = cookie.is_empty();
				let mut controls =
					vec![PagedResults { size: page_size_i32(page_size), cookie }.to_control()?];
				if sorted {
					controls.push(sort_control(&self.query.ordering)?);
				}
				let response = self.search(controls).await?;
				if sorted && first_page && !sort_succeeded(&response.controls)? {
					self.degrade("the server failed to sort the result");
					self.restart_emulated();
					return Ok(());
				}
				let next = paged_cookie(&response.controls)?;
				debug!(entries = response.entries.len(), more = !next.is_empty(), "Fetched page");
				self.buffer.extend(response.entries);
				if next.is_empty() {
					self.exhausted = true;
				} else {
					self.plan = Plan::Paged { page_size, cookie: next, sorted };
				}
			}
			Plan::Window { start, stop } => {
				let window = VlvRequest::for_slice(start, stop - start, 0, None)?;
				let controls = vec![sort_control(&self.query.ordering)?, window.to_control()?];
				let response = match self.search(controls).await {
					Err(err) if is_vlv_fallback(&err) => {
						self.degrade(&format!("virtual list view rejected: {err}"));
						self.restart_emulated();
						return Ok(());
					}
					other => other?,
				};
				let vlv = vlv_response(&response.controls)?;
				let content_count = usize::try_from(vlv.content_count).unwrap_or_default();
				if vlv.result == OFFSET_RANGE_ERROR
					|| (vlv.result == 0 && (start >= content_count || stop > content_count))
				{
					return Err(Error::OutOfRange { start, stop, content_count });
				}
				if vlv.result != 0 || !sort_succeeded(&response.controls)? {
					self.degrade("the server failed to serve the virtual list view");
					self.restart_emulated();
					return Ok(());
				}
				self.buffer.extend(response.entries.into_iter().take(stop - start));
				self.exhausted = true;
			}
			Plan::Emulated => {
				let mut entries = Vec::new();
				if self.capabilities.paging {
					let page_size = self.capabilities.page_size.max(1);
					let mut cookie = Vec::new();
					loop {
						let control =
							PagedResults { size: page_size_i32(page_size), cookie }.to_control()?;
						let response = self.search(vec![control]).await?;
						entries.extend(response.entries);
						cookie = paged_cookie(&response.controls)?;
						if cookie.is_empty() {
							break;
						}
					}
				} else {
					entries = self.search(Vec::new()).await?.entries;
				}
				sort_entries(&self.manager.model, &self.query.ordering, &mut entries);
				self.buffer.extend(entries);
				self.exhausted = true;
			}
		}
		Ok(())
	}

	/// Search with the stream's query and the given controls
	async fn search(&mut self, controls: Vec<RawControl>) -> Result<SearchResponse, Error> {
		let mut request = self.manager.request(
			&self.query.filter,
			self.capabilities.flavor.clone(),
			self.attributes.clone(),
		);
		request.controls = controls;
		let directory = self.registry.get(self.manager.profile(), Role::Read).await?;
		directory.search(&request).await
	}

	/// Start over with client side emulation. Only valid before any entry
	/// was returned.
	fn restart_emulated(&mut self) {
		let slice = self.query.slice.unwrap_or(Slice { start: 0, stop: None, step: 1 });
		self.strategy = Strategy::ClientEmulated { degraded: true };
		self.plan = Plan::Emulated;
		self.buffer.clear();
		self.position = 0;
		self.skip = slice.start;
		self.stop = slice.stop;
		self.step = slice.step.max(1);
		self.exhausted = false;
	}

	/// Report a fallback to client side emulation
	fn degrade(&self, reason: &str) {
		self.manager.cache.note_degradation(self.manager.profile(), &self.query.shape(), reason);
	}

	/// Stop returning entries
	fn finish(&mut self) {
		self.buffer.clear();
		self.exhausted = true;
	}
}

/// Decode an entry with a projection
fn decode(model: &Arc<Model>, projection: &Projection, entry: &SearchEntry) -> Result<Record, Error> {
	match projection {
		Projection::All => model.decode(entry, None),
		Projection::Only(names) | Projection::Values(names) => {
			model.decode(entry, Some(names.as_slice()))
		}
	}
}

/// The sort request for an ordering
fn sort_control(ordering: &[SortKey]) -> Result<RawControl, Error> {
	SortRequest {
		keys: ordering
			.iter()
			.map(|key| SortRequestKey {
				attribute: key.attribute.clone(),
				ordering_rule: None,
				reverse: key.descending,
			})
			.collect(),
	}
	.to_control()
}

/// Whether the server reported a successful sort
fn sort_succeeded(response: &[RawControl]) -> Result<bool, Error> {
	match controls::find(response, SORT_RESPONSE_OID) {
		Some(raw) => Ok(SortResponse::decode(raw)?.result == 0),
		None => Ok(false),
	}
}

/// The cookie of a paged results response, empty when there are no more
/// pages
fn paged_cookie(response: &[RawControl]) -> Result<Vec<u8>, Error> {
	match controls::find(response, PAGED_RESULTS_OID) {
		Some(raw) => Ok(PagedResults::decode(raw)?.cookie),
		None => Ok(Vec::new()),
	}
}

/// The virtual list view response, which a server must send
fn vlv_response(response: &[RawControl]) -> Result<VlvResponse, Error> {
	let raw = controls::find(response, VLV_RESPONSE_OID)
		.ok_or_else(|| Error::decode("The server sent no virtual list view response"))?;
	VlvResponse::decode(raw)
}

/// Whether a failed virtual list view search should be emulated instead
fn is_vlv_fallback(err: &Error) -> bool {
	err.result_code().is_some_and(|code| VLV_FALLBACK_CODES.contains(&code))
}

/// Page sizes beyond the protocol's range are capped
fn page_size_i32(size: u32) -> i32 {
	i32::try_from(size).unwrap_or(i32::MAX)
}

/// Window lengths beyond the protocol's range are capped
fn page_size_u32(size: usize) -> u32 {
	u32::try_from(size).unwrap_or(u32::MAX)
}

/// Stable sort of entries by the decoded values of the sort keys
fn sort_entries(model: &Model, ordering: &[SortKey], entries: &mut Vec<SearchEntry>) {
	if ordering.is_empty() {
		return;
	}
	let mut keyed = entries
		.drain(..)
		.map(|entry| {
			let keys = ordering
				.iter()
				.map(|key| {
					model
						.field(&key.field)
						.and_then(|field| field.decode(&entry.attr_values(&key.attribute)))
						.unwrap_or(Value::Null)
				})
				.collect::<Vec<_>>();
			(keys, entry)
		})
		.collect::<Vec<_>>();
	keyed.sort_by(|(a, _), (b, _)| {
		ordering
			.iter()
			.zip(a.iter().zip(b))
			.map(|(key, (a, b))| {
				let order = a.sort_cmp(b);
				if key.descending {
					order.reverse()
				} else {
					order
				}
			})
			.find(|order| order.is_ne())
			.unwrap_or(std::cmp::Ordering::Equal)
	});
	entries.extend(keyed.into_iter().map(|(_, entry)| entry));
}

/// Split a DN into its RDN and its parent at the first unescaped comma
fn split_dn(dn: &str) -> (&str, &str) {
	let mut escaped = false;
	for (index, c) in dn.char_indices() {
		match c {
			'\\' if !escaped => escaped = true,
			',' if !escaped => return (dn[..index].trim(), dn[index + 1..].trim()),
			_ => escaped = false,
		}
	}
	(dn.trim(), "")
}

/// Whether `dn` is `base` itself or lies somewhere below it
fn is_below(dn: &str, base: &str) -> bool {
	let base = base.trim();
	let mut current = dn.trim();
	while !current.is_empty() {
		if current.eq_ignore_ascii_case(base) {
			return true;
		}
		current = split_dn(current).1;
	}
	false
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{collections::HashMap, sync::Arc};

	use ldap3::SearchEntry;

	use super::{is_below, sort_entries, split_dn};
	use crate::model::{Field, Model};

	#[test]
	fn split_dn_respects_escapes() {
		assert_eq!(split_dn("uid=a,ou=people,dc=example"), ("uid=a", "ou=people,dc=example"));
		assert_eq!(split_dn("cn=Smith\\, John,ou=people"), ("cn=Smith\\, John", "ou=people"));
		assert_eq!(split_dn("cn=a\\\\,ou=people"), ("cn=a\\\\", "ou=people"));
		assert_eq!(split_dn("dc=com"), ("dc=com", ""));
	}

	#[test]
	fn dns_below_the_base() {
		let base = "ou=people,dc=example,dc=com";
		assert!(is_below("uid=a,ou=people,dc=example,dc=com", base));
		assert!(is_below("uid=a, OU=People,dc=example,dc=com", base));
		assert!(is_below(base, base));
		assert!(!is_below("uid=a,ou=groups,dc=example,dc=com", base));
		assert!(!is_below("uid=a,ou=people,dc=example,dc=org", base));
		assert!(!is_below(r"cn=x\,ou=people,dc=example,dc=com,dc=net", base));
	}

	#[test]
	fn client_sort_is_stable() {
		let model = Arc::new(
			Model::builder("User")
				.field(Field::text("uid").primary_key())
				.field(Field::integer("rank"))
				.build()
				.unwrap(),
		);
		let entry = |uid: &str, rank: Option<&str>| SearchEntry {
			dn: format!("uid={uid}"),
			attrs: std::iter::once(("uid".to_owned(), vec![uid.to_owned()]))
				.chain(rank.map(|rank| ("rank".to_owned(), vec![rank.to_owned()])))
				.collect(),
			bin_attrs: HashMap::new(),
		};
		let mut entries =
			vec![entry("c", Some("2")), entry("a", Some("10")), entry("b", Some("2")), entry("d", None)];
		let ordering = model.sort_keys(&["-rank"]).unwrap();
		sort_entries(&model, &ordering, &mut entries);
		let order = entries.iter().map(|entry| entry.dn.as_str()).collect::<Vec<_>>();
		assert_eq!(order, vec!["uid=a", "uid=c", "uid=b", "uid=d"]);
	}
}
