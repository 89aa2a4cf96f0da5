use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use besgate_service::bes::TransactionOutcome;

use super::ResponseError;
use crate::service::GatewayService;

/// Serves a catalog listing for a node.
///
/// The response is the BES `showNode` document, normally straight from the
/// transaction cache. Backend-reported failures come back as the matching
/// HTTP error, also cached.
pub async fn handle_catalog_request(
    State(service): State<GatewayService>,
    Path(path): Path<String>,
) -> Result<Response, ResponseError> {
    let scope = service.open_scope();
    let resource = service.resolve_resource(scope.id(), &path)?;
    tracing::debug!(resource = %resource, "catalog request");

    let outcome = service.catalog_node(&resource).await?;
    Ok(match outcome {
        TransactionOutcome::Success(payload) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            payload.0,
        )
            .into_response(),
        TransactionOutcome::BackendError(error) => ResponseError::from(error).into_response(),
    })
}
