//! Detection and caching of what a directory server supports.
//!
//! Capabilities are read from the root DSE once per server profile and kept in
//! a process-wide [`CapabilityCache`]. Concurrent lookups of a profile that is
//! not cached yet share a single probe. Records are never invalidated
//! automatically; use [`CapabilityCache::refresh`] or
//! [`CapabilityCache::forget`] to force a new probe.
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, OnceLock},
};

use ldap3::{Scope, SearchEntry};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
	config::PagingConfig,
	connection::{Directory, SearchRequest},
	controls::{PAGED_RESULTS_OID, SORT_REQUEST_OID, VLV_REQUEST_OID},
	entry::SearchEntryExt,
	error::Error,
	filter::Filter,
};

/// Root DSE attributes read by the probe
const ROOT_DSE_ATTRIBUTES: [&str; 7] = [
	"vendorName",
	"vendorVersion",
	"forestFunctionality",
	"sizelimit",
	"MaxPageSize",
	"nsslapd-sizelimit",
	"supportedControl",
];

/// Vendor name markers of the 389 Directory Server family
const DS389_VENDORS: [&str; 5] = ["Fedora Project", "Red Hat", "Oracle", "ForgeRock", "389"];

/// The kind of directory server, as far as it matters for encoding quirks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Flavor {
	/// OpenLDAP
	OpenLdap,
	/// Microsoft Active Directory
	ActiveDirectory,
	/// 389 Directory Server and its relatives
	Ds389,
	/// Some other vendor, by vendor name
	Other(String),
	/// The server did not say
	#[default]
	Unknown,
}

impl Flavor {
	/// Infer the flavor from root DSE attributes. `forestFunctionality` is
	/// only published by Active Directory and wins over the vendor name.
	#[must_use]
	pub fn detect(root_dse: &SearchEntry) -> Self {
		if !root_dse.attr_values("forestFunctionality").is_empty() {
			return Self::ActiveDirectory;
		}
		let Some(vendor) = root_dse.attr_first("vendorName") else {
			return Self::Unknown;
		};
		if DS389_VENDORS.iter().any(|marker| vendor.contains(marker)) {
			Self::Ds389
		} else if vendor.contains("OpenLDAP Foundation") {
			Self::OpenLdap
		} else {
			Self::Other(vendor.to_owned())
		}
	}

	/// Whether booleans are spelled `TRUE`/`FALSE` (the standard Boolean
	/// syntax) rather than in lower case.
	#[must_use]
	pub fn uses_uppercase_booleans(&self) -> bool {
		matches!(self, Self::OpenLdap | Self::ActiveDirectory | Self::Ds389)
	}

	/// The root DSE attribute holding the server's size limit
	fn size_limit_attribute(&self) -> Option<&'static str> {
		match self {
			Self::ActiveDirectory => Some("MaxPageSize"),
			Self::Ds389 => Some("nsslapd-sizelimit"),
			Self::OpenLdap => Some("sizelimit"),
			Self::Other(_) | Self::Unknown => None,
		}
	}
}

/// What a server supports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
	/// Simple paged results
	pub paging: bool,
	/// Server side sorting
	pub server_sort: bool,
	/// Virtual list view
	pub vlv: bool,
	/// Server flavor
	pub flavor: Flavor,
	/// Largest page size to request
	pub page_size: u32,
}

impl Capabilities {
	/// A server that supports nothing.
	#[must_use]
	pub fn none(paging: &PagingConfig) -> Self {
		Self {
			paging: false,
			server_sort: false,
			vlv: false,
			flavor: Flavor::Unknown,
			page_size: paging.default_page_size,
		}
	}

	/// Interpret a root DSE entry.
	#[must_use]
	pub fn from_root_dse(root_dse: &SearchEntry, paging: &PagingConfig) -> Self {
		let controls = root_dse
			.attr_values("supportedControl")
			.into_iter()
			.map(|raw| String::from_utf8_lossy(raw).trim().to_owned())
			.collect::<HashSet<_>>();
		let flavor = Flavor::detect(root_dse);
		let page_size = flavor
			.size_limit_attribute()
			.and_then(|attribute| root_dse.attr_first(attribute))
			.and_then(|raw| raw.trim().parse::<i64>().ok())
			.map_or(paging.default_page_size, |size| {
				u32::try_from(size.max(0)).map_or(paging.max_page_size, |size| paging.clamp(size))
			});
		Self {
			paging: controls.contains(PAGED_RESULTS_OID),
			server_sort: controls.contains(SORT_REQUEST_OID),
			vlv: controls.contains(VLV_REQUEST_OID),
			flavor,
			page_size,
		}
	}

	/// Names of the supported features, for logging
	fn features(&self) -> impl Iterator<Item = &'static str> + '_ {
		[
			(self.paging, "paged results"),
			(self.server_sort, "server side sorting"),
			(self.vlv, "virtual list view"),
		]
		.into_iter()
		.filter_map(|(supported, name)| supported.then_some(name))
	}
}

/// Summary of the cache contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
	/// Profiles with a cached record, sorted
	pub cached: Vec<String>,
	/// Distinct degradations reported so far
	pub degradations: usize,
}

/// Process-wide cache of [`Capabilities`], keyed by server profile name.
#[derive(Debug, Default)]
pub struct CapabilityCache {
	/// One cell per profile. Waiting on a cell that is being filled shares the
	/// in-flight probe.
	entries: Mutex<HashMap<String, Arc<OnceCell<Arc<Capabilities>>>>>,
	/// (profile, feature) pairs already logged
	logged_features: Mutex<HashSet<(String, &'static str)>>,
	/// (profile, query shape) pairs already reported as degraded
	degradations: Mutex<HashSet<(String, String)>>,
}

/// The instance shared by all managers that were not given their own
static GLOBAL: OnceLock<Arc<CapabilityCache>> = OnceLock::new();

impl CapabilityCache {
	/// The process-wide instance.
	#[must_use]
	pub fn global() -> Arc<Self> {
		Arc::clone(GLOBAL.get_or_init(Arc::default))
	}

	/// Return the cached record for a profile, probing the server through
	/// `directory` if there is none. Transport errors during the probe are
	/// returned and nothing is cached. If the server refuses the probe, a
	/// record with no capabilities is returned without being cached.
	pub async fn get_or_detect(
		&self,
		profile: &str,
		paging: &PagingConfig,
		directory: &mut dyn Directory,
	) -> Result<Arc<Capabilities>, Error> {
		let cell = Arc::clone(self.lock_entries()?.entry(profile.to_owned()).or_default());
		let probe = cell.get_or_try_init(|| self.probe(profile, paging, directory)).await;
		match probe {
			Ok(capabilities) => Ok(Arc::clone(capabilities)),
			Err(err) if err.is_transport() => Err(err),
			Err(err) => {
				warn!(profile, "LDAP error while querying the root DSE: {err}");
				Ok(Arc::new(Capabilities::none(paging)))
			}
		}
	}

	/// The cached record for a profile, if there is one.
	#[must_use]
	pub fn get(&self, profile: &str) -> Option<Arc<Capabilities>> {
		self.lock_entries().ok()?.get(profile)?.get().cloned()
	}

	/// Drop the record of a profile and probe again.
	pub async fn refresh(
		&self,
		profile: &str,
		paging: &PagingConfig,
		directory: &mut dyn Directory,
	) -> Result<Arc<Capabilities>, Error> {
		self.forget(profile);
		self.get_or_detect(profile, paging, directory).await
	}

	/// Drop the record of a profile. Returns whether there was one.
	pub fn forget(&self, profile: &str) -> bool {
		self.lock_entries()
			.ok()
			.and_then(|mut entries| entries.remove(profile))
			.is_some_and(|cell| cell.initialized())
	}

	/// Drop all records and forget which degradations were reported.
	pub fn clear(&self) {
		if let Ok(mut entries) = self.lock_entries() {
			entries.clear();
		}
		if let Ok(mut degradations) = self.degradations.lock() {
			degradations.clear();
		}
	}

	/// Summary of the cache contents.
	#[must_use]
	pub fn stats(&self) -> CacheStats {
		let mut cached = self
			.lock_entries()
			.map(|entries| {
				entries
					.iter()
					.filter(|(_, cell)| cell.initialized())
					.map(|(profile, _)| profile.clone())
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();
		cached.sort();
		let degradations = self.degradations.lock().map(|set| set.len()).unwrap_or_default();
		CacheStats { cached, degradations }
	}

	/// Report that a query had to be emulated on the client. Logged once per
	/// profile and query shape; returns whether this call logged.
	pub fn note_degradation(&self, profile: &str, shape: &str, reason: &str) -> bool {
		let first = self
			.degradations
			.lock()
			.map(|mut seen| seen.insert((profile.to_owned(), shape.to_owned())))
			.unwrap_or(true);
		if first {
			warn!(profile, shape, "Falling back to client side emulation: {reason}");
		}
		first
	}

	/// Lock the entry map
	fn lock_entries(
		&self,
	) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<Arc<Capabilities>>>>>, Error>
	{
		self.entries
			.lock()
			.map_err(|_| Error::Configuration("Capability cache lock poisoned".to_owned()))
	}

	/// Read the root DSE and interpret it
	async fn probe(
		&self,
		profile: &str,
		paging: &PagingConfig,
		directory: &mut dyn Directory,
	) -> Result<Arc<Capabilities>, Error> {
		let mut request = SearchRequest::subtree(
			"",
			Filter::default(),
			Flavor::Unknown,
			ROOT_DSE_ATTRIBUTES.iter().map(|name| (*name).to_owned()).collect(),
		);
		request.scope = Scope::Base;
		let response = directory.search(&request).await?;
		let capabilities = match response.entries.first() {
			Some(root_dse) => Capabilities::from_root_dse(root_dse, paging),
			None => Capabilities::none(paging),
		};
		debug!(profile, ?capabilities, "Detected server capabilities");
		self.log_features(profile, &capabilities);
		Ok(Arc::new(capabilities))
	}

	/// Log supported features the first time they are seen for a profile
	fn log_features(&self, profile: &str, capabilities: &Capabilities) {
		if let Ok(mut logged) = self.logged_features.lock() {
			for feature in capabilities.features() {
				if logged.insert((profile.to_owned(), feature)) {
					info!(profile, flavor = ?capabilities.flavor, "Server supports {feature}");
				}
			}
		}
		if capabilities.flavor == Flavor::OpenLdap && (!capabilities.server_sort || !capabilities.vlv)
		{
			warn!(
				profile,
				"OpenLDAP server without server side sorting or virtual list view; \
				 enable the sssvlv overlay to avoid client side emulation"
			);
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::{Capabilities, Flavor};
	use crate::{
		config::PagingConfig,
		controls::{PAGED_RESULTS_OID, VLV_REQUEST_OID},
	};

	fn root_dse(attrs: &[(&str, &[&str])]) -> SearchEntry {
		SearchEntry {
			dn: String::new(),
			attrs: attrs
				.iter()
				.map(|(name, values)| {
					((*name).to_owned(), values.iter().map(|value| (*value).to_owned()).collect())
				})
				.collect(),
			bin_attrs: HashMap::new(),
		}
	}

	#[test]
	fn flavor_priority() {
		let ad = root_dse(&[("forestFunctionality", &["7"]), ("vendorName", &["OpenLDAP Foundation"])]);
		assert_eq!(Flavor::detect(&ad), Flavor::ActiveDirectory);
		let rhds = root_dse(&[("vendorName", &["Red Hat, Inc."])]);
		assert_eq!(Flavor::detect(&rhds), Flavor::Ds389);
		let openldap = root_dse(&[("vendorName", &["The OpenLDAP Foundation"])]);
		assert_eq!(Flavor::detect(&openldap), Flavor::OpenLdap);
		let other = root_dse(&[("vendorName", &["Acme"])]);
		assert_eq!(Flavor::detect(&other), Flavor::Other("Acme".to_owned()));
		assert_eq!(Flavor::detect(&root_dse(&[])), Flavor::Unknown);
	}

	#[test]
	fn controls_and_page_size() {
		let paging = PagingConfig::default();
		let dse = root_dse(&[
			("vendorName", &["OpenLDAP Foundation"]),
			("sizelimit", &["500"]),
			("supportedControl", &[PAGED_RESULTS_OID, VLV_REQUEST_OID]),
		]);
		let capabilities = Capabilities::from_root_dse(&dse, &paging);
		assert!(capabilities.paging);
		assert!(capabilities.vlv);
		assert!(!capabilities.server_sort);
		assert_eq!(capabilities.page_size, 500);
	}

	#[test]
	fn page_size_bounds_and_fallbacks() {
		let paging = PagingConfig::default();
		let size = |attrs: &[(&str, &[&str])]| Capabilities::from_root_dse(&root_dse(attrs), &paging).page_size;

		assert_eq!(size(&[("forestFunctionality", &["7"]), ("MaxPageSize", &["99999"])]), 10000);
		assert_eq!(size(&[("vendorName", &["389 Project"]), ("nsslapd-sizelimit", &["-1"])]), 10);
		assert_eq!(size(&[("vendorName", &["389 Project"]), ("nsslapd-sizelimit", &["lots"])]), 1000);
		assert_eq!(size(&[("vendorName", &["OpenLDAP Foundation"])]), 1000);
		assert_eq!(size(&[("vendorName", &["Acme"]), ("sizelimit", &["50"])]), 1000);
	}

	#[test]
	fn boolean_casing() {
		assert!(Flavor::ActiveDirectory.uses_uppercase_booleans());
		assert!(!Flavor::Other("Acme".to_owned()).uses_uppercase_booleans());
		assert!(!Flavor::Unknown.uses_uppercase_booleans());
	}
}
