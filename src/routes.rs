//! The HTTP surface: `GET /stream/{filename}`.
//!
//! Authentication and the rest of the application are expected to be layered
//! or merged around this router by the caller.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::Router;
use tokio::fs::File;

use crate::error::Result;
use crate::{KnownSize, MediaLibrary, Ranged, RangedResponse};

pub fn router(library: MediaLibrary) -> Router {
    Router::new()
        .route("/stream/{filename}", get(stream_audio))
        .with_state(library)
}

/// Stream a stored file, honouring a single-range `Range` header.
#[tracing::instrument(skip(library, headers))]
pub async fn stream_audio(
    State(library): State<MediaLibrary>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<RangedResponse<KnownSize<File>>> {
    let (media, body) = library.open(&filename).await?;
    let range = headers.get(header::RANGE).cloned();

    let response = Ranged::new(range, body, Some(media.content_type)).try_respond()?;
    tracing::debug!(status = %response.status(), "stream session opened");
    Ok(response)
}
