//! Resolution of a client `Range` header against a known resource length.
//!
//! [`resolve`] is the single place where range syntax is interpreted. It
//! performs no I/O and never panics: every input maps to either a
//! [`ServingPlan`] or [`RangeNotSatisfiable`].
//!
//! Only single ranges are served. A header this module cannot read (wrong
//! unit, garbage, negative numbers, several comma separated ranges) is
//! treated as if the client had not sent one, which HTTP permits.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::ContentRange;
use axum_extra::TypedHeader;

const BYTES_UNIT: &str = "bytes";

/// Whether a plan covers the whole resource or a sub-range of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// No usable range was requested, serve everything with `200 OK`.
    Full,
    /// One satisfiable byte interval, served with `206 Partial Content`.
    Partial,
}

/// Validated instructions for serving a resource.
///
/// Always satisfies `start + length <= total_length`. A [`PlanMode::Full`]
/// plan starts at zero and spans `total_length` bytes, which may be none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingPlan {
    mode: PlanMode,
    start: u64,
    length: u64,
    total_length: u64,
}

impl ServingPlan {
    /// A plan serving the whole resource.
    pub fn full(total_length: u64) -> Self {
        ServingPlan { mode: PlanMode::Full, start: 0, length: total_length, total_length }
    }

    fn partial(start: u64, end: u64, total_length: u64) -> Self {
        debug_assert!(start <= end && end < total_length);
        ServingPlan { mode: PlanMode::Partial, start, length: end - start + 1, total_length }
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    /// First byte offset to serve.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte offset to serve, inclusive. `None` for an empty resource.
    pub fn end(&self) -> Option<u64> {
        (self.start + self.length).checked_sub(1)
    }

    /// Number of bytes the body will carry.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn is_partial(&self) -> bool {
        self.mode == PlanMode::Partial
    }

    /// The `Content-Range` header for a partial plan.
    pub fn content_range(&self) -> Option<ContentRange> {
        match self.mode {
            PlanMode::Full => None,
            PlanMode::Partial => {
                ContentRange::bytes(self.start..self.start + self.length, self.total_length).ok()
            }
        }
    }
}

/// Error type indicating that the requested range was not satisfiable.
/// Implements [`IntoResponse`] as an empty `416` carrying `Content-Range: bytes */<len>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNotSatisfiable {
    pub total_length: u64,
}

impl RangeNotSatisfiable {
    pub fn content_range(&self) -> ContentRange {
        ContentRange::unsatisfied_bytes(self.total_length)
    }
}

impl std::fmt::Display for RangeNotSatisfiable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "range not satisfiable for resource of {} bytes", self.total_length)
    }
}

impl std::error::Error for RangeNotSatisfiable {}

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.content_range());
        (status, header, ()).into_response()
    }
}

/// A single syntactically valid byte-range-spec, not yet checked against
/// the resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `bytes=<first>-<last>`
    FromTo(u64, u64),
    /// `bytes=<first>-`
    From(u64),
    /// `bytes=-<suffix length>`
    Suffix(u64),
}

/// Resolve an optional raw `Range` header value against `total_length`.
///
/// ```
/// use voxly_stream::plan::{resolve, PlanMode};
///
/// let plan = resolve(Some("bytes=200-399"), 1000).unwrap();
/// assert_eq!(PlanMode::Partial, plan.mode());
/// assert_eq!((200, Some(399), 200), (plan.start(), plan.end(), plan.length()));
///
/// assert!(resolve(Some("bytes=900-1500"), 1000).is_err());
/// assert_eq!(PlanMode::Full, resolve(Some("pages=1-2"), 1000).unwrap().mode());
/// ```
pub fn resolve(range: Option<&str>, total_length: u64) -> Result<ServingPlan, RangeNotSatisfiable> {
    let Some(spec) = range.and_then(parse_range_spec) else {
        return Ok(ServingPlan::full(total_length));
    };

    let unsatisfiable = RangeNotSatisfiable { total_length };
    let last = total_length.checked_sub(1).ok_or(unsatisfiable)?;

    match spec {
        RangeSpec::FromTo(start, end) if start <= end && end <= last => {
            Ok(ServingPlan::partial(start, end, total_length))
        }
        RangeSpec::From(start) if start <= last => Ok(ServingPlan::partial(start, last, total_length)),
        RangeSpec::Suffix(suffix) if suffix > 0 => {
            Ok(ServingPlan::partial(total_length.saturating_sub(suffix), last, total_length))
        }
        _ => Err(unsatisfiable),
    }
}

/// Like [`resolve`], taking the header as it arrives on the request.
/// Values that are not visible ASCII count as malformed.
pub fn resolve_header(
    range: Option<&HeaderValue>,
    total_length: u64,
) -> Result<ServingPlan, RangeNotSatisfiable> {
    resolve(range.and_then(|value| value.to_str().ok()), total_length)
}

fn parse_range_spec(header: &str) -> Option<RangeSpec> {
    let (unit, set) = header.trim().split_once('=')?;
    if !unit.trim_end().eq_ignore_ascii_case(BYTES_UNIT) {
        return None;
    }

    let set = set.trim();
    if set.contains(',') {
        return None;
    }

    let (first, last) = set.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    match (first.is_empty(), last.is_empty()) {
        (false, false) => Some(RangeSpec::FromTo(parse_pos(first)?, parse_pos(last)?)),
        (false, true) => Some(RangeSpec::From(parse_pos(first)?)),
        (true, false) => Some(RangeSpec::Suffix(parse_pos(last)?)),
        (true, true) => None,
    }
}

/// Parse a `1*DIGIT` position. Signs are rejected; values beyond `u64`
/// saturate so they are still checked against the resource length.
fn parse_pos(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.parse().unwrap_or(u64::MAX))
}
