//! Config for the LDAP client.
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Configuration for which variant of ISO8601 to use for parsing and
/// serializing time. Configured according the syntax definition
/// `( 1.3.6.1.4.1.1466.115.121.1.24 DESC 'Generalized Time' )` described in
/// RFC4517 section 3.1.13
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// Top level configuration: a set of named server profiles.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// Server profiles, keyed by the profile name models refer to
	pub servers: HashMap<String, ServerProfile>,
	/// Bounds for page sizes
	#[serde(default)]
	pub paging: PagingConfig,
}

/// A directory server, reachable through separate read and write endpoints.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerProfile {
	/// The default base DN for models using this profile
	#[serde(default)]
	pub base_dn: Option<String>,
	/// Endpoint used for searches
	pub read: EndpointConfig,
	/// Endpoint used for add, modify, delete and rename
	pub write: EndpointConfig,
}

/// How to reach and authenticate against a single endpoint.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EndpointConfig {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	pub url: Url,
	/// The DN to bind as
	pub bind_dn: String,
	/// The password to bind with. Anonymous binds are not supported, so a
	/// missing password is a configuration error.
	#[serde(default)]
	pub password: Option<String>,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Client-side size limit for searches, 0 for none
	#[serde(default)]
	pub size_limit: i32,
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout. For search per reply.
	pub operation_timeout: Duration,

	/// TLS config
	#[serde(default)]
	pub tls: TLSConfig,
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	#[serde(default)]
	pub starttls: bool,

	/// Disable verification of TLS certificates
	#[serde(default)]
	pub no_tls_verify: bool,

	/// TLS root certificates path
	#[serde(default)]
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	#[serde(default)]
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	#[serde(default)]
	pub client_certificate_path: Option<PathBuf>,
}

/// Page size bounds applied to the limits servers advertise
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
	/// Page size used when the server does not advertise one
	pub default_page_size: u32,
	/// Lower bound for page sizes
	pub min_page_size: u32,
	/// Upper bound for page sizes
	pub max_page_size: u32,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { timeout: 15, operation_timeout: Duration::from_secs(15), tls: TLSConfig::default() }
	}
}

impl Default for PagingConfig {
	fn default() -> Self {
		Self { default_page_size: 1000, min_page_size: 10, max_page_size: 10000 }
	}
}

impl PagingConfig {
	/// Clamp a page size into the configured bounds. Inverted bounds are
	/// rejected by [`PagingConfig::validate`]; here the upper bound wins.
	#[must_use]
	pub fn clamp(&self, size: u32) -> u32 {
		size.max(self.min_page_size).min(self.max_page_size)
	}

	/// Check the bounds for consistency.
	pub fn validate(&self) -> Result<(), Error> {
		if self.min_page_size > self.max_page_size {
			return Err(Error::Configuration(format!(
				"min_page_size ({}) cannot be greater than max_page_size ({})",
				self.min_page_size, self.max_page_size
			)));
		}
		if self.default_page_size < self.min_page_size
			|| self.default_page_size > self.max_page_size
		{
			return Err(Error::Configuration(format!(
				"default_page_size ({}) must be between min_page_size ({}) and max_page_size ({})",
				self.default_page_size, self.min_page_size, self.max_page_size
			)));
		}
		Ok(())
	}
}

impl Config {
	/// Look up a server profile by name.
	pub fn profile(&self, name: &str) -> Result<&ServerProfile, Error> {
		self.servers
			.get(name)
			.ok_or_else(|| Error::Configuration(format!("No server profile named '{name}'")))
	}

	/// Validate the whole configuration up front, rather than failing on the
	/// first connection attempt.
	pub fn validate(&self) -> Result<(), Error> {
		self.paging.validate()?;
		for (name, profile) in &self.servers {
			profile.read.validate(name)?;
			profile.write.validate(name)?;
		}
		Ok(())
	}
}

impl EndpointConfig {
	/// The credential to bind with.
	pub fn credential(&self) -> Result<&str, Error> {
		match self.password.as_deref() {
			Some(password) if !password.is_empty() => Ok(password),
			_ => Err(Error::Configuration(format!(
				"No password configured for {} at {}; anonymous binds are not supported",
				self.bind_dn, self.url
			))),
		}
	}

	/// Check the endpoint for settings that cannot work together.
	pub fn validate(&self, profile: &str) -> Result<(), Error> {
		self.credential()?;
		if self.bind_dn.is_empty() {
			return Err(Error::Configuration(format!("Profile '{profile}' has an empty bind DN")));
		}
		if self.connection.tls.starttls && self.url.scheme() == "ldaps" {
			return Err(Error::Configuration(format!(
				"Profile '{profile}': StartTLS cannot be combined with an ldaps:// URL"
			)));
		}
		Ok(())
	}
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			for der in rustls_pemfile::certs(&mut pem.as_slice())? {
				roots
					.add(&Certificate(der))
					.map_err(|_| Error::Invalid("Could not read root certificate".to_owned()))?;
			}
			if roots.is_empty() {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}

			let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);
			let tls = match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
				(Some(key_path), Some(cert_path)) => {
					let certs = rustls_pemfile::certs(&mut tokio::fs::read(cert_path).await?.as_slice())?
						.into_iter()
						.map(Certificate)
						.collect::<Vec<_>>();
					let key = rustls_pemfile::pkcs8_private_keys(
						&mut tokio::fs::read(key_path).await?.as_slice(),
					)?
					.into_iter()
					.next()
					.ok_or_else(|| Error::Invalid("Could not read client certificates".to_owned()))?;
					if certs.is_empty() {
						return Err(Error::Invalid("Could not read client certificates".to_owned()));
					}
					builder
						.with_client_auth_cert(certs, PrivateKey(key))
						.map_err(|_| Error::Invalid("Could not read client certificates".to_owned()))?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => Err(Error::Invalid(
					"Both a client certificate and key file in PKCS8 format must be specified"
						.to_owned(),
				))?,
			};
			settings = settings.set_config(Arc::new(tls));
		}
		Ok(settings)
	}
}
