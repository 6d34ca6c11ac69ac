//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
///
/// Attribute names are compared case-insensitively, as the server may return
/// a different casing than was requested.
pub trait SearchEntryExt {
	/// Get all values of an attribute in binary form, regardless of whether
	/// the server sent them as text or binary.
	fn attr_values(&self, attr: &str) -> Vec<&[u8]>;

	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_values(attr).first().and_then(|raw| std::str::from_utf8(raw).ok())
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_values(&self, attr: &str) -> Vec<&[u8]> {
		let text = self
			.attrs
			.iter()
			.filter(|(name, _)| name.eq_ignore_ascii_case(attr))
			.flat_map(|(_, values)| values.iter().map(String::as_bytes));
		let binary = self
			.bin_attrs
			.iter()
			.filter(|(name, _)| name.eq_ignore_ascii_case(attr))
			.flat_map(|(_, values)| values.iter().map(Vec::as_slice));
		text.chain(binary).collect()
	}
}

#[cfg(test)]
mod tests {
	use ldap3::SearchEntry;

	use super::SearchEntryExt;

	#[test]
	fn attr_first() {
		let entry = SearchEntry {
			dn: String::from("dontcare"),
			attrs: [(
				String::from("vendorName"),
				vec![String::from("OpenLDAP Foundation"), String::from("Someone Else")],
			)]
			.into_iter()
			.collect(),
			bin_attrs: [(String::from("blob"), vec![vec![0xff, 0xfe]])].into_iter().collect(),
		};
		assert_eq!(
			entry.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(
			entry.attr_first("vendorname"),
			Some("OpenLDAP Foundation"),
			"Should return the first value"
		);
		assert_eq!(entry.attr_first("blob"), None, "Invalid UTF-8 should return None");
	}

	#[test]
	fn attr_values_ignores_case_and_merges_binary() {
		let entry = SearchEntry {
			dn: String::from("dontcare"),
			attrs: [(String::from("objectClass"), vec![String::from("top")])].into_iter().collect(),
			bin_attrs: [(String::from("objectclass"), vec![vec![0xff]])].into_iter().collect(),
		};
		let values = entry.attr_values("OBJECTCLASS");
		assert_eq!(values, vec![b"top".as_slice(), &[0xff_u8][..]]);
		assert!(entry.attr_values("cn").is_empty());
	}
}
