//! Connection handles and the registry that owns them.
//!
//! A [`ConnectionRegistry`] is an execution context: it holds at most one live
//! handle per (profile, role) and is passed explicitly into every operation
//! that talks to a server. Registries are never shared between tasks; create
//! one per request or worker.
use std::{
	collections::{HashMap, HashSet},
	fmt::Debug,
	sync::Arc,
};

use async_trait::async_trait;
use ldap3::{controls::RawControl, Scope, SearchEntry};
use tracing::{debug, warn};

use crate::{
	capabilities::Flavor,
	config::{Config, EndpointConfig},
	error::Error,
	filter::Filter,
	modlist::Change,
};

/// Result code a server returns when it stopped at a size limit
pub const SIZE_LIMIT_EXCEEDED: u32 = 4;

/// Which endpoint of a profile an operation goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
	/// Searches
	Read,
	/// Add, modify, delete and rename
	Write,
}

/// A single search operation.
#[derive(Clone, Debug)]
pub struct SearchRequest {
	/// Base DN
	pub base: String,
	/// Search scope
	pub scope: Scope,
	/// Filter tree, rendered by the handle
	pub filter: Filter,
	/// Flavor the filter is rendered for
	pub flavor: Flavor,
	/// Attributes to return. Empty for all user attributes
	pub attributes: Vec<String>,
	/// Request controls
	pub controls: Vec<RawControl>,
	/// Maximum number of entries, 0 for no limit
	pub size_limit: i32,
}

impl SearchRequest {
	/// A subtree search with no controls or limits.
	#[must_use]
	pub fn subtree(base: &str, filter: Filter, flavor: Flavor, attributes: Vec<String>) -> Self {
		Self {
			base: base.to_owned(),
			scope: Scope::Subtree,
			filter,
			flavor,
			attributes,
			controls: Vec::new(),
			size_limit: 0,
		}
	}
}

/// The answer to a search. Continuation references are not included.
#[derive(Clone, Debug, Default)]
pub struct SearchResponse {
	/// Matched entries in server order
	pub entries: Vec<SearchEntry>,
	/// Response controls
	pub controls: Vec<RawControl>,
	/// Result code, either success or [`SIZE_LIMIT_EXCEEDED`]
	pub code: u32,
	/// Diagnostic message
	pub message: String,
}

/// A bound connection to one endpoint of a directory server.
///
/// Implementations return [`Error::Transport`] for network failures and a
/// rejected [`Error::Protocol`] for non-success result codes, except for
/// [`SIZE_LIMIT_EXCEEDED`] on searches, which is reported in the response.
#[async_trait]
pub trait Directory: Send + Debug {
	/// Run one search operation
	async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, Error>;

	/// Add an entry
	async fn add(&mut self, dn: &str, attributes: Vec<(String, HashSet<Vec<u8>>)>)
		-> Result<(), Error>;

	/// Apply attribute changes to an entry
	async fn modify(&mut self, dn: &str, changes: Vec<Change>) -> Result<(), Error>;

	/// Delete an entry
	async fn delete(&mut self, dn: &str) -> Result<(), Error>;

	/// Change the RDN of an entry and optionally move it
	async fn rename(
		&mut self,
		dn: &str,
		new_rdn: &str,
		new_superior: Option<&str>,
	) -> Result<(), Error>;

	/// Close the connection
	async fn unbind(&mut self) -> Result<(), Error>;
}

/// Creates bound handles for endpoints.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
	/// Connect to an endpoint and bind with its credential
	async fn connect(
		&self,
		profile: &str,
		role: Role,
		endpoint: &EndpointConfig,
	) -> Result<Box<dyn Directory>, Error>;
}

/// Lazily connected handles for one execution context.
#[derive(Debug)]
pub struct ConnectionRegistry {
	/// Server profiles
	config: Arc<Config>,
	/// Creates handles on first use
	connector: Arc<dyn Connector>,
	/// Live handles
	handles: HashMap<(String, Role), Box<dyn Directory>>,
}

impl ConnectionRegistry {
	/// Create an empty registry. No connection is made until a handle is
	/// requested.
	#[must_use]
	pub fn new(config: Arc<Config>, connector: Arc<dyn Connector>) -> Self {
		Self { config, connector, handles: HashMap::new() }
	}

	/// The configuration handles are created from
	#[must_use]
	pub fn config(&self) -> &Arc<Config> {
		&self.config
	}

	/// Get the handle for a profile and role, connecting and binding on first
	/// use.
	pub async fn get(&mut self, profile: &str, role: Role) -> Result<&mut dyn Directory, Error> {
		let key = (profile.to_owned(), role);
		if !self.handles.contains_key(&key) {
			let server = self.config.profile(profile)?;
			let endpoint = match role {
				Role::Read => &server.read,
				Role::Write => &server.write,
			};
			debug!(profile, ?role, url = %endpoint.url, "Connecting");
			let handle = self.connector.connect(profile, role, endpoint).await?;
			self.handles.insert(key.clone(), handle);
		}
		match self.handles.get_mut(&key) {
			Some(handle) => Ok(handle.as_mut()),
			None => Err(Error::Configuration(format!("No connection for profile '{profile}'"))),
		}
	}

	/// Bind to the profile's read endpoint as another principal, such as an
	/// end user whose password is checked. The handle is not kept by the
	/// registry; the caller owns it and should unbind it.
	pub async fn bind_as(
		&self,
		profile: &str,
		principal: &str,
		password: &str,
	) -> Result<Box<dyn Directory>, Error> {
		let mut endpoint = self.config.profile(profile)?.read.clone();
		endpoint.bind_dn = principal.to_owned();
		endpoint.password = Some(password.to_owned());
		debug!(profile, principal, url = %endpoint.url, "Binding as principal");
		self.connector.connect(profile, Role::Read, &endpoint).await
	}

	/// Replace the handle for a profile and role with one created elsewhere.
	/// The previous handle, if any, is returned without being unbound.
	pub fn set(
		&mut self,
		profile: &str,
		role: Role,
		handle: Box<dyn Directory>,
	) -> Option<Box<dyn Directory>> {
		self.handles.insert((profile.to_owned(), role), handle)
	}

	/// Whether any handle for the profile is live.
	#[must_use]
	pub fn has(&self, profile: &str) -> bool {
		self.handles.keys().any(|(name, _)| name == profile)
	}

	/// Whether the handle for a profile and role is live.
	#[must_use]
	pub fn has_role(&self, profile: &str, role: Role) -> bool {
		self.handles.contains_key(&(profile.to_owned(), role))
	}

	/// Unbind and drop both handles of a profile. Unbind failures are logged,
	/// the handles are dropped regardless.
	pub async fn disconnect(&mut self, profile: &str) {
		for role in [Role::Read, Role::Write] {
			if let Some(mut handle) = self.handles.remove(&(profile.to_owned(), role)) {
				if let Err(err) = handle.unbind().await {
					warn!(profile, ?role, "Unbind failed: {err}");
				}
			}
		}
	}

	/// Unbind and drop all handles.
	pub async fn disconnect_all(&mut self) {
		let profiles =
			self.handles.keys().map(|(name, _)| name.clone()).collect::<HashSet<String>>();
		for profile in profiles {
			self.disconnect(&profile).await;
		}
	}
}
