//! File downloads.

use axum::{
    body::Body,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::instrument;

use super::{respond, SignatureQuery, State, HASH_HEADER};
use crate::error::NodeResult;
use bmcl::file::validate_hash;

/// Serves a file by hash.
///
/// The cluster that signed the URL is credited with the request.
#[instrument(skip_all, fields(hash))]
pub(super) async fn download(
    Extension(state): Extension<State>,
    Path(hash): Path<String>,
    Query(query): Query<SignatureQuery>,
) -> NodeResult<Response> {
    validate_hash(&hash)?;
    let hash = hash.to_ascii_lowercase();
    tracing::Span::current().record("hash", hash.as_str());

    let key = state.verify(&hash, &query)?;

    if state.sync.is_empty_file(&hash) {
        key.counters.record(0);
        return Ok((StatusCode::OK, [(HASH_HEADER, hash)], Body::empty()).into_response());
    }

    let file = state.find_file(&hash).await?;
    let size = file.size();
    let response = respond(&hash, file).await?;

    tracing::debug!(cluster = %key.cluster_id, size, "Serving");
    key.counters.record(size);

    Ok(response)
}
