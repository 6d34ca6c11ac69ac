//! Choosing how a query is bounded on the wire.
//!
//! | Query                               | Server supports           | Strategy           |
//! |-------------------------------------|---------------------------|--------------------|
//! | no slice, no ordering               | anything                  | `NoLimit`          |
//! | `[:stop]`                           | paging (and sort, if ordered) | `ServerPage`   |
//! | `[start:stop]`, `start > 0`, ordered| virtual list view         | `VirtualListSlice` |
//! | ordered                             | server side sort          | `ServerSort`       |
//! | anything else                       |                           | `ClientEmulated`   |
//!
//! A window with a non-zero start on a server with virtual list view support
//! but without an ordering is refused: positions are meaningless without a
//! total order.
use crate::{
	capabilities::Capabilities,
	cursor::Cursor,
	error::Error,
	query::Query,
};

/// How a query is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
	/// One unbounded search, paged transparently if the server supports it
	NoLimit,
	/// Fetch pages until `limit` entries are collected or the server runs out
	ServerPage {
		/// Entries per page
		page_size: u32,
		/// Number of entries wanted
		limit: usize,
		/// Whether a sort control accompanies the paging control
		sorted: bool,
	},
	/// Fetch exactly the window `[start, stop)` of the sorted result set
	VirtualListSlice {
		/// First position, 0-based
		start: usize,
		/// Position after the last one
		stop: usize,
	},
	/// Let the server sort, bound the result on the client
	ServerSort,
	/// Fetch everything, then sort and slice on the client
	ClientEmulated {
		/// Whether a server-side strategy would have applied had the server
		/// supported it
		degraded: bool,
	},
}

/// Pick the strategy for a query.
pub fn select(query: &Query, capabilities: &Capabilities) -> Result<Strategy, Error> {
	let ordered = !query.ordering.is_empty();
	let Some(slice) = query.slice else {
		return Ok(if !ordered {
			Strategy::NoLimit
		} else if capabilities.server_sort {
			Strategy::ServerSort
		} else {
			Strategy::ClientEmulated { degraded: true }
		});
	};

	if slice.is_prefix() && capabilities.paging && (!ordered || capabilities.server_sort) {
		let limit = slice.stop.unwrap_or_default();
		let page_size = u32::try_from(limit).unwrap_or(u32::MAX).clamp(1, capabilities.page_size.max(1));
		return Ok(Strategy::ServerPage { page_size, limit, sorted: ordered });
	}

	if let (true, Some(stop)) = (slice.is_bounded_window(), slice.stop) {
		if capabilities.vlv {
			if !ordered {
				return Err(Error::Configuration(
					"A virtual list view slice needs an ordering; call order_by() first".to_owned(),
				));
			}
			return Ok(Strategy::VirtualListSlice { start: slice.start, stop });
		}
	}

	if ordered && capabilities.server_sort {
		return Ok(Strategy::ServerSort);
	}

	let degraded = (ordered && !capabilities.server_sort)
		|| (slice.is_prefix() && !capabilities.paging)
		|| (slice.is_bounded_window() && !capabilities.vlv);
	Ok(Strategy::ClientEmulated { degraded })
}

/// How one page of [`Manager::page`](crate::manager::Manager) is fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStrategy {
	/// Simple paged results
	Paged {
		/// Whether a sort control accompanies the paging control
		sorted: bool,
	},
	/// A virtual list view window
	Vlv,
	/// Fetch everything and cut out the page on the client
	Offset,
}

/// Pick how to fetch a page. A cursor must have been produced by the same
/// strategy. Offset cursors are accepted everywhere: a server side strategy
/// that had to fall back to the client keeps going on the client.
pub fn select_page(
	query: &Query,
	capabilities: &Capabilities,
	cursor: Option<&Cursor>,
) -> Result<PageStrategy, Error> {
	if let Some(Cursor::Offset { .. }) = cursor {
		return Ok(PageStrategy::Offset);
	}
	let ordered = !query.ordering.is_empty();
	let strategy = if ordered && capabilities.vlv {
		PageStrategy::Vlv
	} else if capabilities.paging && (!ordered || capabilities.server_sort) {
		PageStrategy::Paged { sorted: ordered }
	} else {
		PageStrategy::Offset
	};
	match (strategy, cursor) {
		(_, None)
		| (PageStrategy::Paged { .. }, Some(Cursor::Paged { .. }))
		| (PageStrategy::Vlv, Some(Cursor::Vlv { .. }))
		| (PageStrategy::Offset, Some(Cursor::Offset { .. })) => Ok(strategy),
		_ => Err(Error::InvalidCursor("Cursor does not belong to this kind of query".to_owned())),
	}
}
