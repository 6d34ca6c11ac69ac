//! Relational-style queries against LDAP directory servers.
//!
//! Entity types are described as [`Model`]s: an object class, a base DN and a
//! set of typed fields mapped onto directory attributes. A [`Manager`] then
//! offers a chainable query builder ([`QuerySet`]) with filtering, ordering,
//! projection and slicing, plus create, modify, delete and rename of single
//! entries.
//!
//! Directory servers differ widely in which search controls they implement.
//! The first query against a server profile reads its root DSE and caches
//! which of the [simple paged results], [server side sorting] and
//! [virtual list view] controls it supports. Every query is then executed
//! with the most efficient strategy the server allows, falling back to
//! fetching everything and sorting or slicing on the client when it has to.
//! Such fallbacks are logged once per kind of query.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [simple paged results]: https://www.rfc-editor.org/rfc/rfc2696
//! [server side sorting]: https://www.rfc-editor.org/rfc/rfc2891
//! [virtual list view]: https://datatracker.ietf.org/doc/html/draft-ietf-ldapext-ldapv3-vlv-09
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use ldap_query::{Config, ConnectionRegistry, Field, LdapConnector, Manager, Model};
//!
//! let config: Config = serde_json::from_str(&std::fs::read_to_string("ldap.json")?)?;
//! config.validate()?;
//! let config = Arc::new(config);
//!
//! let users = Model::builder("User")
//!     .object_class("inetOrgPerson")
//!     .extra_object_class("top")
//!     .base_dn("ou=people,dc=example,dc=com")
//!     .ordering(&["uid"])
//!     .field(Field::text("uid").primary_key())
//!     .field(Field::text("full_name").attribute("cn"))
//!     .field(Field::integer("uid_number").attribute("uidNumber"))
//!     .build()?;
//! let users = Manager::new(Arc::new(users), Arc::clone(&config))?;
//!
//! // One registry per task; it owns the connections.
//! let mut registry = ConnectionRegistry::new(config, Arc::new(LdapConnector));
//!
//! let page = users
//!     .filter("full_name__icontains", "john")?
//!     .order_by(&["-uid_number"])?
//!     .slice(20..30)?
//!     .list(&mut registry)
//!     .await?;
//! for user in &page {
//!     println!("{}: {:?}", user.pk().as_text().unwrap_or_default(), user.get("full_name")?);
//! }
//!
//! let john = users.get_by_pk(&mut registry, "john.doe").await?;
//! let renamed = john.clone().with("full_name", "John Q. Doe")?;
//! users.modify(&mut registry, &john, &renamed).await?;
//!
//! registry.disconnect_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Only simple binds are supported, and every endpoint needs a credential.
//! * Capability records are never refreshed on their own. Call
//!   [`CapabilityCache::refresh`] after a server was reconfigured.
//! * Client side emulation loads the whole result set into memory.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing bind
//!   passwords, it probably should be
//! * There is no connection pooling; a [`ConnectionRegistry`] holds one
//!   connection per profile and role.

pub mod capabilities;
pub mod config;
pub mod connection;
pub mod controls;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod manager;
pub mod model;
pub mod modlist;
pub mod query;
pub mod strategy;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	capabilities::{Capabilities, CapabilityCache, Flavor},
	config::{Config, ConnectionConfig, EndpointConfig, PagingConfig, ServerProfile},
	connection::{ConnectionRegistry, Connector, Directory, Role},
	cursor::Cursor,
	entry::SearchEntryExt,
	error::Error,
	filter::{Filter, Operator},
	ldap::LdapConnector,
	manager::{Manager, Page, QueryStream},
	model::{Field, FieldKind, Model, Record, Value},
	query::QuerySet,
	strategy::Strategy,
};
