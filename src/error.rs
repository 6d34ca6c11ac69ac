//! Error codes

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The library was configured or used incorrectly: a missing credential,
	/// an unknown field or lookup, an operator applied to a field type that
	/// does not support it, or a virtual list view slice without an ordering.
	/// These are never retried.
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// The connection to the directory server could not be established or
	/// broke down (connection refused, timeout, TLS negotiation failure).
	#[error("Transport error: {0}")]
	Transport(#[source] ldap3::LdapError),
	/// The server refused the bind with the configured principal.
	#[error("Authentication as {principal} failed ({code}): {message}")]
	Authentication {
		/// The DN that was used for binding
		principal: String,
		/// The LDAP result code returned for the bind
		code: u32,
		/// The diagnostic message returned by the server
		message: String,
	},
	/// A control could not be decoded, or the server rejected an operation.
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
	/// `get` matched no entries.
	#[error("No entry matching the query exists")]
	NotFound,
	/// `get` matched more than one entry.
	#[error("More than one entry matched the query")]
	MultipleMatches,
	/// The lower bound of a slice lies beyond the server-reported number of
	/// matching entries.
	#[error("Slice {start}..{stop} is out of range for {content_count} entries")]
	OutOfRange {
		/// Requested start of the slice
		start: usize,
		/// Requested end of the slice
		stop: usize,
		/// Number of entries the server reported
		content_count: usize,
	},
	/// A pagination cursor could not be decoded.
	#[error("Invalid cursor: {0}")]
	InvalidCursor(String),
	/// A required attribute in a search result was missing.
	#[error("Missing data: {0}")]
	Missing(String),
	/// The contents of an attribute did not confirm to the expected syntax.
	#[error("Malformed data: {0}")]
	Invalid(String),
	/// Reading TLS material from disk failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Failures on the protocol level, kept apart so that a decoding problem on
/// our side can be told apart from a server refusing an operation.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
	/// Control bytes (or another BER structure) were malformed.
	#[error("Malformed control value: {0}")]
	Decode(String),
	/// The server answered with a non-success result code.
	#[error("Server rejected {operation} ({code}): {message}")]
	Rejected {
		/// The operation that was rejected
		operation: &'static str,
		/// The LDAP result code
		code: u32,
		/// The diagnostic message returned by the server
		message: String,
	},
}

impl Error {
	/// Shorthand for a decode failure
	pub(crate) fn decode(message: impl Into<String>) -> Self {
		Self::Protocol(ProtocolError::Decode(message.into()))
	}

	/// Shorthand for an operation the server refused
	pub(crate) fn rejected(operation: &'static str, code: u32, message: impl Into<String>) -> Self {
		Self::Protocol(ProtocolError::Rejected { operation, code, message: message.into() })
	}

	/// The LDAP result code, if the server rejected an operation.
	#[must_use]
	pub fn result_code(&self) -> Option<u32> {
		match self {
			Self::Protocol(ProtocolError::Rejected { code, .. }) => Some(*code),
			Self::Authentication { code, .. } => Some(*code),
			_ => None,
		}
	}

	/// Whether the error stems from the network rather than from the server's
	/// answer.
	#[must_use]
	pub fn is_transport(&self) -> bool {
		matches!(self, Self::Transport(_))
	}
}

impl From<ldap3::LdapError> for Error {
	fn from(err: ldap3::LdapError) -> Self {
		match err {
			ldap3::LdapError::LdapResult { result } => {
				Self::rejected("operation", result.rc, result.text)
			}
			ldap3::LdapError::FilterParsing => {
				Self::Configuration("The search filter could not be parsed".to_owned())
			}
			ldap3::LdapError::UrlParsing { .. }
			| ldap3::LdapError::UnknownScheme(_)
			| ldap3::LdapError::AddNoValues => Self::Configuration(err.to_string()),
			ldap3::LdapError::DecodingUTF8
			| ldap3::LdapError::UnrecognizedCriticalExtension(_) => Self::decode(err.to_string()),
			// The codec reports malformed BER as invalid data
			ldap3::LdapError::Io { ref source } if source.kind() == std::io::ErrorKind::InvalidData => {
				Self::decode(err.to_string())
			}
			other => Self::Transport(other),
		}
	}
}
