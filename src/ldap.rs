//! Connection handles backed by an LDAP server

use std::collections::HashSet;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, Mod, SearchEntry, SearchOptions};
use tracing::{debug, warn};

use crate::{
	config::EndpointConfig,
	connection::{Connector, Directory, Role, SearchRequest, SearchResponse, SIZE_LIMIT_EXCEEDED},
	error::Error,
	modlist::Change,
};

/// Connects to LDAP servers with [`ldap3`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

/// A bound connection to an LDAP server.
#[derive(Debug)]
pub struct LdapDirectory {
	/// The ldap3 handle. The connection itself is driven by a background task.
	ldap: ldap3::Ldap,
	/// The profile this handle belongs to, for log messages
	profile: String,
	/// The endpoint the handle is connected to
	endpoint: EndpointConfig,
}

impl LdapDirectory {
	/// Create a connection to an ldap server based on the settings and url
	/// specified in the configuration, and bind with the endpoint's
	/// credential.
	pub async fn connect(profile: &str, endpoint: &EndpointConfig) -> Result<Self, Error> {
		let password = endpoint.credential()?;
		let settings = endpoint.connection.to_settings().await?;
		let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(settings, &endpoint.url)
			.await?;
		let name = profile.to_owned();
		tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!(profile = %name, "Ldap connection error {err}");
			}
		});

		let bind = ldap
			.with_timeout(endpoint.connection.operation_timeout)
			.simple_bind(&endpoint.bind_dn, password)
			.await?;
		if bind.rc != 0 {
			return Err(Error::Authentication {
				principal: endpoint.bind_dn.clone(),
				code: bind.rc,
				message: bind.text,
			});
		}
		debug!(profile, url = %endpoint.url, "Bound as {}", endpoint.bind_dn);
		Ok(Self { ldap, profile: profile.to_owned(), endpoint: endpoint.clone() })
	}

	/// Map the result of a write operation
	fn check(operation: &'static str, result: ldap3::LdapResult) -> Result<(), Error> {
		if result.rc == 0 {
			Ok(())
		} else {
			Err(Error::rejected(operation, result.rc, result.text))
		}
	}
}

#[async_trait]
impl Connector for LdapConnector {
	async fn connect(
		&self,
		profile: &str,
		_role: Role,
		endpoint: &EndpointConfig,
	) -> Result<Box<dyn Directory>, Error> {
		Ok(Box::new(LdapDirectory::connect(profile, endpoint).await?))
	}
}

#[async_trait]
impl Directory for LdapDirectory {
	async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, Error> {
		let filter = request.filter.render(&request.flavor);
		debug!(profile = %self.profile, base = %request.base, %filter, "Searching");
		let mut options = SearchOptions::new();
		let size_limit = match (request.size_limit, self.endpoint.size_limit) {
			(0, limit) | (limit, 0) => limit,
			(requested, configured) => requested.min(configured),
		};
		if size_limit > 0 {
			options = options.sizelimit(size_limit);
		}
		let ldap3::SearchResult(entries, result) = self
			.ldap
			.with_timeout(self.endpoint.connection.operation_timeout)
			.with_controls(request.controls.clone())
			.with_search_options(options)
			.search(&request.base, request.scope, &filter, &request.attributes)
			.await?;
		if result.rc != 0 && result.rc != SIZE_LIMIT_EXCEEDED {
			return Err(Error::rejected("search", result.rc, result.text));
		}
		// Continuation references carry no entry
		let entries = entries
			.into_iter()
			.filter(|entry| !entry.is_ref() && !entry.is_intermediate())
			.map(SearchEntry::construct)
			.collect();
		Ok(SearchResponse {
			entries,
			controls: result.ctrls.into_iter().map(|control| control.1).collect(),
			code: result.rc,
			message: result.text,
		})
	}

	async fn add(
		&mut self,
		dn: &str,
		attributes: Vec<(String, HashSet<Vec<u8>>)>,
	) -> Result<(), Error> {
		let attributes = attributes
			.into_iter()
			.map(|(name, values)| (name.into_bytes(), values))
			.collect::<Vec<_>>();
		let result = self
			.ldap
			.with_timeout(self.endpoint.connection.operation_timeout)
			.add(dn, attributes)
			.await?;
		Self::check("add", result)
	}

	async fn modify(&mut self, dn: &str, changes: Vec<Change>) -> Result<(), Error> {
		let mods = changes
			.into_iter()
			.map(|change| match change {
				Change::Add { attribute, values } => {
					Mod::Add(attribute.into_bytes(), values.into_iter().collect())
				}
				Change::Delete { attribute } => Mod::Delete(attribute.into_bytes(), HashSet::new()),
				Change::Replace { attribute, values } => {
					Mod::Replace(attribute.into_bytes(), values.into_iter().collect())
				}
			})
			.collect::<Vec<Mod<Vec<u8>>>>();
		let result = self
			.ldap
			.with_timeout(self.endpoint.connection.operation_timeout)
			.modify(dn, mods)
			.await?;
		Self::check("modify", result)
	}

	async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		let result = self
			.ldap
			.with_timeout(self.endpoint.connection.operation_timeout)
			.delete(dn)
			.await?;
		Self::check("delete", result)
	}

	async fn rename(
		&mut self,
		dn: &str,
		new_rdn: &str,
		new_superior: Option<&str>,
	) -> Result<(), Error> {
		let result = self
			.ldap
			.with_timeout(self.endpoint.connection.operation_timeout)
			.modifydn(dn, new_rdn, true, new_superior)
			.await?;
		Self::check("rename", result)
	}

	async fn unbind(&mut self) -> Result<(), Error> {
		Ok(self.ldap.unbind().await?)
	}
}
