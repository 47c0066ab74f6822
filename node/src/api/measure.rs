//! Bandwidth measurement.

use std::io;

use axum::{
    body::Body,
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream;
use tracing::instrument;

use super::{SignatureQuery, State};
use crate::error::{NodeError, NodeResult};
use crate::storage::MIB;

/// Largest measurement the node serves, in MiB.
const MAX_MEASURE_SIZE: u64 = 200;

static ZEROS: [u8; MIB as usize] = [0; MIB as usize];

/// Serves `size` MiB of zeros.
///
/// The signature covers the path, `/measure/{size}`.
#[instrument(skip_all)]
pub(super) async fn measure(
    Extension(state): Extension<State>,
    Path(size): Path<u64>,
    Query(query): Query<SignatureQuery>,
) -> NodeResult<Response> {
    state.verify(&format!("/measure/{}", size), &query)?;

    if size == 0 || size > MAX_MEASURE_SIZE {
        return Err(NodeError::NotFound);
    }

    let chunks = stream::iter((0..size).map(|_| Ok::<_, io::Error>(Bytes::from_static(&ZEROS))));

    Ok((
        StatusCode::OK,
        [(header::CONTENT_LENGTH, (size * MIB).to_string())],
        Body::from_stream(chunks),
    )
        .into_response())
}
