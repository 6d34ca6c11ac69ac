//! BER codecs for the search controls used to bound result sets.
//!
//! Three controls are supported: simple paged results (RFC 2696), the virtual
//! list view (draft-ietf-ldapext-ldapv3-vlv) and server side sorting
//! (RFC 2891), which the virtual list view depends on. Every decoder rejects
//! malformed input with [`ProtocolError::Decode`](crate::error::ProtocolError)
//! instead of panicking or filling in defaults.
use bytes::BytesMut;
use ldap3::{
	asn1::{
		parse_tag, write, ASNTag, Boolean, Enumerated, Integer, OctetString, Sequence,
		StructureTag, Tag, TagClass, Types, PL,
	},
	controls::RawControl,
};

use crate::error::Error;

/// Simple paged results, request and response
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// Virtual list view request
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
/// Virtual list view response
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
/// Server side sort request
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// Server side sort response
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";

/// The simple paged results control. In a request, `size` is the page size;
/// in a response it is the server's estimate of the remaining entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PagedResults {
	/// Page size or estimate
	pub size: i32,
	/// Opaque server cookie, empty on the first request and after the last
	/// page
	pub cookie: Vec<u8>,
}

impl PagedResults {
	/// Encode the control value.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		encode(Tag::Sequence(Sequence {
			inner: vec![
				Tag::Integer(Integer { inner: self.size.into(), ..Default::default() }),
				Tag::OctetString(OctetString { inner: self.cookie.clone(), ..Default::default() }),
			],
			..Default::default()
		}))
	}

	/// Decode a control value.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let mut fields = sequence(bytes, "paged results")?.into_iter();
		let size = to_i32(integer(next(&mut fields, "size")?, Types::Integer)?, "size")?;
		let cookie = octets(next(&mut fields, "cookie")?, TagClass::Universal, Types::OctetString as u64)?;
		done(fields, "paged results")?;
		Ok(Self { size, cookie })
	}

	/// The request control
	pub fn to_control(&self) -> Result<RawControl, Error> {
		Ok(RawControl { ctype: PAGED_RESULTS_OID.to_owned(), crit: true, val: Some(self.encode()?) })
	}
}

/// Which entry a virtual list view request is centered on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VlvTarget {
	/// A 1-based position, scaled by the server against its own count if
	/// `content_count` differs from it. A `content_count` of 0 means unknown.
	ByOffset {
		/// Position of the target entry
		offset: i32,
		/// The client's idea of the total number of entries
		content_count: i32,
	},
	/// The first entry whose sort key is greater than or equal to the value
	GreaterThanOrEqual(Vec<u8>),
}

/// The virtual list view request control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlvRequest {
	/// Entries to return before the target
	pub before_count: i32,
	/// Entries to return after the target
	pub after_count: i32,
	/// The target entry
	pub target: VlvTarget,
	/// Context handed out by the server on a previous response
	pub context_id: Option<Vec<u8>>,
}

impl VlvRequest {
	/// Request the `len` entries starting at the 0-based position `start` of
	/// the sorted result set. `content_count_hint` is the count reported by a
	/// previous response, or 0 if there was none.
	pub fn for_slice(
		start: usize,
		len: usize,
		content_count_hint: usize,
		context_id: Option<Vec<u8>>,
	) -> Result<Self, Error> {
		if len == 0 {
			return Err(Error::Configuration("A virtual list view window cannot be empty".to_owned()));
		}
		let offset = start
			.checked_add(1)
			.and_then(|offset| i32::try_from(offset).ok())
			.ok_or_else(|| Error::Configuration(format!("Slice start {start} is too large")))?;
		Ok(Self {
			before_count: 0,
			after_count: i32::try_from(len - 1)
				.map_err(|_| Error::Configuration(format!("Slice length {len} is too large")))?,
			target: VlvTarget::ByOffset {
				offset,
				content_count: i32::try_from(content_count_hint).unwrap_or(i32::MAX),
			},
			context_id,
		})
	}

	/// Encode the control value.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		let target = match &self.target {
			VlvTarget::ByOffset { offset, content_count } => Tag::Sequence(Sequence {
				class: TagClass::Context,
				id: 0,
				inner: vec![
					Tag::Integer(Integer { inner: (*offset).into(), ..Default::default() }),
					Tag::Integer(Integer { inner: (*content_count).into(), ..Default::default() }),
				],
			}),
			VlvTarget::GreaterThanOrEqual(value) => Tag::OctetString(OctetString {
				class: TagClass::Context,
				id: 1,
				inner: value.clone(),
			}),
		};
		let mut inner = vec![
			Tag::Integer(Integer { inner: self.before_count.into(), ..Default::default() }),
			Tag::Integer(Integer { inner: self.after_count.into(), ..Default::default() }),
			target,
		];
		if let Some(context_id) = &self.context_id {
			inner.push(Tag::OctetString(OctetString {
				inner: context_id.clone(),
				..Default::default()
			}));
		}
		encode(Tag::Sequence(Sequence { inner, ..Default::default() }))
	}

	/// Decode a control value.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let mut fields = sequence(bytes, "virtual list view request")?.into_iter();
		let before_count =
			to_i32(integer(next(&mut fields, "beforeCount")?, Types::Integer)?, "beforeCount")?;
		let after_count =
			to_i32(integer(next(&mut fields, "afterCount")?, Types::Integer)?, "afterCount")?;
		let target = next(&mut fields, "target")?;
		let target = match (target.class, target.id) {
			(TagClass::Context, 0) => {
				let mut parts = target
					.expect_constructed()
					.ok_or_else(|| Error::decode("byOffset must be constructed"))?
					.into_iter();
				let offset =
					to_i32(integer(next(&mut parts, "offset")?, Types::Integer)?, "offset")?;
				let content_count = to_i32(
					integer(next(&mut parts, "contentCount")?, Types::Integer)?,
					"contentCount",
				)?;
				done(parts, "byOffset")?;
				VlvTarget::ByOffset { offset, content_count }
			}
			(TagClass::Context, 1) => VlvTarget::GreaterThanOrEqual(
				target
					.expect_primitive()
					.ok_or_else(|| Error::decode("greaterThanOrEqual must be primitive"))?,
			),
			(class, id) => {
				return Err(Error::decode(format!("Unexpected VLV target tag {class:?}/{id}")))
			}
		};
		let context_id = fields
			.next()
			.map(|tag| octets(tag, TagClass::Universal, Types::OctetString as u64))
			.transpose()?;
		done(fields, "virtual list view request")?;
		Ok(Self { before_count, after_count, target, context_id })
	}

	/// The request control
	pub fn to_control(&self) -> Result<RawControl, Error> {
		Ok(RawControl { ctype: VLV_REQUEST_OID.to_owned(), crit: true, val: Some(self.encode()?) })
	}
}

/// The virtual list view response control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlvResponse {
	/// 1-based position of the target entry
	pub target_position: i32,
	/// The server's count of entries in the sorted result set
	pub content_count: i32,
	/// The virtualListViewResult code, 0 on success
	pub result: i32,
	/// Context to hand back on the next request
	pub context_id: Option<Vec<u8>>,
}

impl VlvResponse {
	/// Encode the control value.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		let mut inner = vec![
			Tag::Integer(Integer { inner: self.target_position.into(), ..Default::default() }),
			Tag::Integer(Integer { inner: self.content_count.into(), ..Default::default() }),
			Tag::Enumerated(Enumerated { inner: self.result.into(), ..Default::default() }),
		];
		if let Some(context_id) = &self.context_id {
			inner.push(Tag::OctetString(OctetString {
				inner: context_id.clone(),
				..Default::default()
			}));
		}
		encode(Tag::Sequence(Sequence { inner, ..Default::default() }))
	}

	/// Decode a control value.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let mut fields = sequence(bytes, "virtual list view response")?.into_iter();
		let target_position = to_i32(
			integer(next(&mut fields, "targetPosition")?, Types::Integer)?,
			"targetPosition",
		)?;
		let content_count =
			to_i32(integer(next(&mut fields, "contentCount")?, Types::Integer)?, "contentCount")?;
		let result = to_i32(
			integer(next(&mut fields, "virtualListViewResult")?, Types::Enumerated)?,
			"virtualListViewResult",
		)?;
		let context_id = fields
			.next()
			.map(|tag| octets(tag, TagClass::Universal, Types::OctetString as u64))
			.transpose()?;
		done(fields, "virtual list view response")?;
		Ok(Self { target_position, content_count, result, context_id })
	}

	/// The response control, as a server would send it
	pub fn to_control(&self) -> Result<RawControl, Error> {
		Ok(RawControl { ctype: VLV_RESPONSE_OID.to_owned(), crit: false, val: Some(self.encode()?) })
	}
}

/// One key of a server side sort request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortRequestKey {
	/// Attribute to sort by
	pub attribute: String,
	/// Matching rule to sort with, if not the attribute's default
	pub ordering_rule: Option<String>,
	/// Sort in descending order
	pub reverse: bool,
}

/// The server side sort request control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortRequest {
	/// Sort keys, most significant first
	pub keys: Vec<SortRequestKey>,
}

impl SortRequest {
	/// Encode the control value.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		let keys = self
			.keys
			.iter()
			.map(|key| {
				let mut inner = vec![Tag::OctetString(OctetString {
					inner: key.attribute.as_bytes().to_vec(),
					..Default::default()
				})];
				if let Some(rule) = &key.ordering_rule {
					inner.push(Tag::OctetString(OctetString {
						class: TagClass::Context,
						id: 0,
						inner: rule.as_bytes().to_vec(),
					}));
				}
				if key.reverse {
					inner.push(Tag::Boolean(Boolean {
						class: TagClass::Context,
						id: 1,
						inner: true,
					}));
				}
				Tag::Sequence(Sequence { inner, ..Default::default() })
			})
			.collect();
		encode(Tag::Sequence(Sequence { inner: keys, ..Default::default() }))
	}

	/// Decode a control value.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let keys = sequence(bytes, "sort request")?
			.into_iter()
			.map(|key| {
				let key = key
					.match_class(TagClass::Universal)
					.and_then(|key| key.match_id(Types::Sequence as u64))
					.and_then(StructureTag::expect_constructed)
					.ok_or_else(|| Error::decode("Sort key must be a sequence"))?;
				let mut parts = key.into_iter();
				let attribute = utf8(
					octets(next(&mut parts, "attributeType")?, TagClass::Universal, Types::OctetString as u64)?,
					"attributeType",
				)?;
				let mut ordering_rule = None;
				let mut reverse = false;
				for part in parts {
					match (part.class, part.id) {
						(TagClass::Context, 0) if ordering_rule.is_none() && !reverse => {
							let raw = part
								.expect_primitive()
								.ok_or_else(|| Error::decode("orderingRule must be primitive"))?;
							ordering_rule = Some(utf8(raw, "orderingRule")?);
						}
						(TagClass::Context, 1) if !reverse => {
							let raw = part
								.expect_primitive()
								.ok_or_else(|| Error::decode("reverseOrder must be primitive"))?;
							match raw.as_slice() {
								[flag] => reverse = *flag != 0,
								_ => return Err(Error::decode("reverseOrder must be one byte")),
							}
						}
						(class, id) => {
							return Err(Error::decode(format!(
								"Unexpected sort key element {class:?}/{id}"
							)))
						}
					}
				}
				Ok(SortRequestKey { attribute, ordering_rule, reverse })
			})
			.collect::<Result<Vec<_>, Error>>()?;
		Ok(Self { keys })
	}

	/// The request control. Not critical, so that a server unable to sort
	/// still answers and reports the failure in the response control.
	pub fn to_control(&self) -> Result<RawControl, Error> {
		Ok(RawControl { ctype: SORT_REQUEST_OID.to_owned(), crit: false, val: Some(self.encode()?) })
	}
}

/// The server side sort response control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortResponse {
	/// The sortResult code, 0 on success
	pub result: i32,
	/// The attribute that caused a failure, if any
	pub attribute: Option<String>,
}

impl SortResponse {
	/// Encode the control value.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		let mut inner =
			vec![Tag::Enumerated(Enumerated { inner: self.result.into(), ..Default::default() })];
		if let Some(attribute) = &self.attribute {
			inner.push(Tag::OctetString(OctetString {
				class: TagClass::Context,
				id: 0,
				inner: attribute.as_bytes().to_vec(),
			}));
		}
		encode(Tag::Sequence(Sequence { inner, ..Default::default() }))
	}

	/// Decode a control value.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let mut fields = sequence(bytes, "sort response")?.into_iter();
		let result =
			to_i32(integer(next(&mut fields, "sortResult")?, Types::Enumerated)?, "sortResult")?;
		let attribute = fields
			.next()
			.map(|tag| utf8(octets(tag, TagClass::Context, 0)?, "attributeType"))
			.transpose()?;
		done(fields, "sort response")?;
		Ok(Self { result, attribute })
	}

	/// The response control, as a server would send it
	pub fn to_control(&self) -> Result<RawControl, Error> {
		Ok(RawControl { ctype: SORT_RESPONSE_OID.to_owned(), crit: false, val: Some(self.encode()?) })
	}
}

/// The value of the first control with the given OID.
#[must_use]
pub fn find<'a>(controls: &'a [RawControl], oid: &str) -> Option<&'a [u8]> {
	controls.iter().find(|control| control.ctype == oid).and_then(|control| control.val.as_deref())
}

/// Serialize a tag
fn encode(tag: Tag) -> Result<Vec<u8>, Error> {
	let mut buf = BytesMut::new();
	write::encode_into(&mut buf, tag.into_structure())?;
	Ok(buf.to_vec())
}

/// Parse exactly one universal SEQUENCE and return its elements
fn sequence(bytes: &[u8], what: &str) -> Result<Vec<StructureTag>, Error> {
	let (rest, tag) =
		parse_tag(bytes).map_err(|_| Error::decode(format!("{what}: not a BER element")))?;
	if !rest.is_empty() {
		return Err(Error::decode(format!("{what}: {} trailing bytes", rest.len())));
	}
	tag.match_class(TagClass::Universal)
		.and_then(|tag| tag.match_id(Types::Sequence as u64))
		.and_then(StructureTag::expect_constructed)
		.ok_or_else(|| Error::decode(format!("{what}: expected a sequence")))
}

/// The next element of a sequence, which must exist
fn next(fields: &mut impl Iterator<Item = StructureTag>, name: &str) -> Result<StructureTag, Error> {
	fields.next().ok_or_else(|| Error::decode(format!("Missing element {name}")))
}

/// Fail if a sequence has more elements than expected
fn done(mut fields: impl Iterator<Item = StructureTag>, what: &str) -> Result<(), Error> {
	match fields.next() {
		Some(_) => Err(Error::decode(format!("{what}: unexpected trailing elements"))),
		None => Ok(()),
	}
}

/// Decode a universal INTEGER or ENUMERATED as two's complement
fn integer(tag: StructureTag, kind: Types) -> Result<i64, Error> {
	let (expected, id) = (kind as u64, tag.id);
	let raw = tag
		.match_class(TagClass::Universal)
		.and_then(|tag| tag.match_id(expected))
		.and_then(StructureTag::expect_primitive)
		.ok_or_else(|| Error::decode(format!("Expected tag {expected}, got tag {id}")))?;
	match raw.as_slice() {
		[] => Err(Error::decode("Empty integer")),
		bytes if bytes.len() > 8 => Err(Error::decode("Integer too large")),
		bytes => {
			let init = if bytes[0] & 0x80 == 0 { 0_i64 } else { -1_i64 };
			Ok(bytes.iter().fold(init, |acc, byte| (acc << 8) | i64::from(*byte)))
		}
	}
}

/// Narrow a decoded integer to the range the protocol allows
fn to_i32(value: i64, name: &str) -> Result<i32, Error> {
	i32::try_from(value).map_err(|_| Error::decode(format!("{name} out of range: {value}")))
}

/// Decode an OCTET STRING with the given tag
fn octets(tag: StructureTag, class: TagClass, id: u64) -> Result<Vec<u8>, Error> {
	tag.match_class(class)
		.and_then(|tag| tag.match_id(id))
		.and_then(|tag| match tag.payload {
			PL::P(bytes) => Some(bytes),
			PL::C(_) => None,
		})
		.ok_or_else(|| Error::decode(format!("Expected octet string {class:?}/{id}")))
}

/// Interpret bytes as UTF-8
fn utf8(raw: Vec<u8>, name: &str) -> Result<String, Error> {
	String::from_utf8(raw).map_err(|_| Error::decode(format!("{name} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{
		find, PagedResults, SortRequest, SortRequestKey, SortResponse, VlvRequest, VlvResponse,
		VlvTarget, PAGED_RESULTS_OID,
	};
	use crate::error::{Error, ProtocolError};

	#[test]
	fn paged_results_known_encoding() {
		let control = PagedResults { size: 100, cookie: b"ab".to_vec() };
		let bytes = control.encode().unwrap();
		assert_eq!(bytes, vec![0x30, 0x07, 0x02, 0x01, 0x64, 0x04, 0x02, b'a', b'b']);
		assert_eq!(PagedResults::decode(&bytes).unwrap(), control);
	}

	#[test]
	fn vlv_request_for_slice() {
		let request = VlvRequest::for_slice(20, 10, 25, Some(b"ctx".to_vec())).unwrap();
		assert_eq!(request.before_count, 0);
		assert_eq!(request.after_count, 9);
		assert_eq!(request.target, VlvTarget::ByOffset { offset: 21, content_count: 25 });
		assert_eq!(VlvRequest::decode(&request.encode().unwrap()).unwrap(), request);
		assert!(VlvRequest::for_slice(0, 0, 0, None).is_err());
	}

	#[test]
	fn vlv_request_greater_than_or_equal() {
		let request = VlvRequest {
			before_count: 1,
			after_count: 2,
			target: VlvTarget::GreaterThanOrEqual(b"m".to_vec()),
			context_id: None,
		};
		assert_eq!(VlvRequest::decode(&request.encode().unwrap()).unwrap(), request);
	}

	#[test]
	fn vlv_response_round_trip() {
		let response = VlvResponse {
			target_position: 21,
			content_count: 25,
			result: 0,
			context_id: Some(vec![0, 1, 2]),
		};
		assert_eq!(VlvResponse::decode(&response.encode().unwrap()).unwrap(), response);

		let without_context = VlvResponse { context_id: None, ..response };
		assert_eq!(VlvResponse::decode(&without_context.encode().unwrap()).unwrap(), without_context);
	}

	#[test]
	fn sort_round_trip() {
		let request = SortRequest {
			keys: vec![
				SortRequestKey { attribute: "sn".to_owned(), ordering_rule: None, reverse: true },
				SortRequestKey {
					attribute: "cn".to_owned(),
					ordering_rule: Some("caseIgnoreOrderingMatch".to_owned()),
					reverse: false,
				},
			],
		};
		assert_eq!(SortRequest::decode(&request.encode().unwrap()).unwrap(), request);

		let response = SortResponse { result: 16, attribute: Some("sn".to_owned()) };
		assert_eq!(SortResponse::decode(&response.encode().unwrap()).unwrap(), response);
	}

	#[test]
	fn malformed_input_is_rejected() {
		let valid = PagedResults { size: 5, cookie: Vec::new() }.encode().unwrap();
		let cases: Vec<Vec<u8>> = vec![
			Vec::new(),
			vec![0x30],
			vec![0x30, 0x05, 0x02, 0x01],
			vec![0x04, 0x00],
			vec![0x30, 0x00],
			[valid.as_slice(), &[0x00]].concat(),
			valid[..valid.len() - 1].to_vec(),
		];
		for bytes in cases {
			assert!(
				matches!(PagedResults::decode(&bytes), Err(Error::Protocol(ProtocolError::Decode(_)))),
				"{bytes:?} should be rejected"
			);
			assert!(VlvResponse::decode(&bytes).is_err());
			assert!(VlvRequest::decode(&bytes).is_err());
		}

		// An enumerated where the size integer belongs
		assert!(PagedResults::decode(&[0x30, 0x05, 0x0a, 0x01, 0x01, 0x04, 0x00]).is_err());
		// A size beyond the 32 bit range
		assert!(PagedResults::decode(&[0x30, 0x08, 0x02, 0x04, 0x7f, 0xff, 0xff, 0xff, 0x04, 0x00])
			.is_ok());
		assert!(PagedResults::decode(&[
			0x30, 0x09, 0x02, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00
		])
		.is_err());
	}

	#[test]
	fn find_control() {
		let control = PagedResults { size: 1, cookie: vec![1] }.to_control().unwrap();
		let controls = vec![control];
		assert!(find(&controls, PAGED_RESULTS_OID).is_some());
		assert!(find(&controls, "1.2.3").is_none());
	}
}
