//! Opaque pagination cursors.
//!
//! A cursor is handed to callers as URL-safe base64 of a small JSON document,
//! so it can travel as a query parameter. It is only valid for the query and
//! page size that produced it; that is not checked beyond decoding.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Where the next page starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
	/// Continue a simple paged search
	Paged {
		/// The server's cookie, echoed back verbatim
		cookie: Vec<u8>,
	},
	/// Continue a virtual list view
	Vlv {
		/// Context handed out by the server
		context_id: Option<Vec<u8>>,
		/// 0-based position of the next page
		offset: usize,
		/// Content count reported with the previous page
		content_count: usize,
	},
	/// Continue a client side emulated listing
	Offset {
		/// 0-based position of the next page
		offset: usize,
	},
}

impl Cursor {
	/// Serialize to a transport-safe string.
	pub fn encode(&self) -> Result<String, Error> {
		let json = serde_json::to_vec(self)
			.map_err(|err| Error::InvalidCursor(format!("Cannot serialize cursor: {err}")))?;
		Ok(URL_SAFE_NO_PAD.encode(json))
	}

	/// Parse a string produced by [`Cursor::encode`].
	pub fn decode(token: &str) -> Result<Self, Error> {
		let json = URL_SAFE_NO_PAD
			.decode(token.trim())
			.map_err(|err| Error::InvalidCursor(format!("Not base64: {err}")))?;
		serde_json::from_slice(&json)
			.map_err(|err| Error::InvalidCursor(format!("Malformed cursor: {err}")))
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::Cursor;
	use crate::error::Error;

	#[test]
	fn round_trip() {
		let cursors = [
			Cursor::Paged { cookie: vec![0, 255, 7] },
			Cursor::Vlv { context_id: Some(b"ctx".to_vec()), offset: 40, content_count: 95 },
			Cursor::Vlv { context_id: None, offset: 0, content_count: 0 },
			Cursor::Offset { offset: 20 },
		];
		for cursor in cursors {
			let token = cursor.encode().unwrap();
			assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
			assert_eq!(Cursor::decode(&token).unwrap(), cursor);
		}
	}

	#[test]
	fn garbage_is_rejected() {
		for token in ["", "!!!", "bm90IGpzb24", "eyJraW5kIjoibm9wZSJ9"] {
			assert!(matches!(Cursor::decode(token), Err(Error::InvalidCursor(_))), "{token}");
		}
	}
}
