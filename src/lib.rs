//! # voxly-stream
//!
//! HTTP range streaming of stored audio files for [`axum`][1].
//!
//! A request is served in three steps: the [`MediaLibrary`] turns an opaque
//! file name into an open file and its length, [`plan::resolve`] turns the
//! client's `Range` header into a [`ServingPlan`], and [`Ranged`] turns the
//! plan and the file into a `200`, `206` or `416` response whose body is a
//! [`RangedStream`] reading the file in bounded chunks.
//!
//! Any type implementing both [`AsyncRead`] and [`AsyncSeekStart`] can be
//! streamed through the [`KnownSize`] adapter struct. There is also special
//! cased support for [`tokio::fs::File`], see the [`KnownSize::file`] method.
//!
//! [`AsyncSeekStart`] is a trait defined by this crate which only allows
//! seeking from the start of a file. It is automatically implemented for any
//! type implementing [`AsyncSeek`].
//!
//! ```no_run
//! use axum::http::{header, HeaderMap};
//! use axum::routing::get;
//! use axum::Router;
//!
//! use voxly_stream::{KnownSize, Ranged};
//!
//! async fn file(headers: HeaderMap) -> Ranged<KnownSize<tokio::fs::File>> {
//!     let file = tokio::fs::File::open("uploads/intro.mp3").await.unwrap();
//!     let body = KnownSize::file(file).await.unwrap();
//!     let range = headers.get(header::RANGE).cloned();
//!     Ranged::new(range, body, Some("audio/mpeg".to_owned()))
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::<()>::new().route("/", get(file));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! For the full route with file name validation see [`routes::router`].
//!
//! [1]: https://docs.rs/axum

pub mod config;
pub mod error;
mod file;
pub mod library;
pub mod plan;
pub mod routes;
mod stream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, ContentType};
use axum_extra::TypedHeader;
use tokio::io::{AsyncRead, AsyncSeek};

pub use error::StreamError;
pub use file::KnownSize;
pub use library::{MediaFile, MediaLibrary};
pub use plan::{PlanMode, RangeNotSatisfiable, ServingPlan};
pub use stream::{RangedStream, SessionPhase, CHUNK_SIZE};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying file.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// A source that turns out shorter than this fails the transfer with
    /// [`io::ErrorKind::UnexpectedEof`].
    fn byte_size(&self) -> u64;

    /// Upper bound on the bytes read per chunk while streaming.
    fn chunk_size(&self) -> usize { CHUNK_SIZE }
}

/// The main responder type. Implements [`IntoResponse`].
///
/// Holds the raw `Range` header rather than a typed one: a header that does
/// not parse must fall back to the full body instead of rejecting the request.
#[derive(Debug)]
pub struct Ranged<B: RangeBody + Send + 'static> {
    range: Option<HeaderValue>,
    body: B,
    content_type: Option<String>,
}

impl<B: RangeBody + Send + 'static> Ranged<B> {
    /// Construct a ranged response over any type implementing [`RangeBody`]
    /// and an optional raw `Range` header value.
    pub fn new(range: Option<HeaderValue>, body: B, content_type: Option<String>) -> Self {
        Ranged { range, body, content_type }
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] error if requested
    /// range in header was not satisfiable.
    pub fn try_respond(self) -> Result<RangedResponse<B>, RangeNotSatisfiable> {
        let total_bytes = self.body.byte_size();
        let plan = plan::resolve_header(self.range.as_ref(), total_bytes)?;

        let content_type = self.content_type;
        let content_length = ContentLength(plan.length());
        let stream = RangedStream::new(self.body, &plan);

        match plan.content_range() {
            None => {
                tracing::debug!(total_bytes, "serving full content");
                Ok(RangedResponse::Full { content_length, stream, content_type })
            }
            Some(content_range) => {
                tracing::debug!(total_bytes, start = plan.start(), length = plan.length(), "serving partial content");
                Ok(RangedResponse::Partial { content_range, content_length, stream, content_type })
            }
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for Ranged<B> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Data type containing computed headers and body for a range response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse<B> {
    /// No usable range requested, `200 OK` with the whole resource.
    Full {
        content_length: ContentLength,
        stream: RangedStream<B>,
        content_type: Option<String>,
    },
    /// One satisfiable range, `206 Partial Content`.
    Partial {
        content_range: ContentRange,
        content_length: ContentLength,
        stream: RangedStream<B>,
        content_type: Option<String>,
    },
}

impl<B> RangedResponse<B> {
    pub fn status(&self) -> StatusCode {
        match self {
            RangedResponse::Full { .. } => StatusCode::OK,
            RangedResponse::Partial { .. } => StatusCode::PARTIAL_CONTENT,
        }
    }

    pub fn stream(&self) -> &RangedStream<B> {
        match self {
            RangedResponse::Full { stream, .. } | RangedResponse::Partial { stream, .. } => stream,
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedResponse<B> {
    fn into_response(self) -> Response {
        let status = self.status();
        let accept_ranges = TypedHeader(AcceptRanges::bytes());

        match self {
            RangedResponse::Full { content_length, stream, content_type } => {
                let content_type = content_type_header(content_type);
                (status, accept_ranges, TypedHeader(content_length), content_type, stream).into_response()
            }
            RangedResponse::Partial { content_range, content_length, stream, content_type } => {
                let content_type = content_type_header(content_type);
                (
                    status,
                    accept_ranges,
                    TypedHeader(content_range),
                    TypedHeader(content_length),
                    content_type,
                    stream,
                ).into_response()
            }
        }
    }
}

fn content_type_header(content_type: Option<String>) -> TypedHeader<ContentType> {
    let mime = content_type
        .and_then(|content_type| content_type.parse().ok())
        .unwrap_or(mime_guess::mime::APPLICATION_OCTET_STREAM);
    TypedHeader(ContentType::from(mime))
}
