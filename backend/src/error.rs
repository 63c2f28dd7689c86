use axum::{http::StatusCode, response::IntoResponse, Json};
use shared::{ApiError, UnknownProfile, SUPPORTED_MODES};
use thiserror::Error;

use crate::{
    cache::CacheError,
    loader::FetchError,
    solver::{SolveError, SolverError},
};

/// Typed failure surface of the service. The HTTP mapping below is the only
/// place where errors become status codes.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("operation not permitted")]
    Forbidden,
    #[error("no graph available for the requested region")]
    UnavailableRegion(#[source] CacheError),
    #[error("upstream provider unavailable")]
    UpstreamUnavailable(#[source] FetchError),
    #[error("no route could be produced")]
    RouteUnavailable,
    #[error("selected locations are not connected by the road network")]
    Disconnected,
    #[error("pickup/delivery pairing cannot be satisfied: {0}")]
    InconsistentPdp(String),
    #[error("internal error")]
    Internal,
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServiceError::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::UnavailableRegion(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ServiceError::RouteUnavailable => StatusCode::NOT_FOUND,
            ServiceError::Disconnected | ServiceError::InconsistentPdp(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UnknownProfile> for ServiceError {
    fn from(err: UnknownProfile) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Fetch(fetch) => ServiceError::UpstreamUnavailable(fetch),
            other => ServiceError::UnavailableRegion(other),
        }
    }
}

impl From<SolverError> for ServiceError {
    fn from(err: SolverError) -> Self {
        match err {
            SolverError::Disconnected => ServiceError::Disconnected,
            SolverError::InconsistentPdp(detail) => ServiceError::InconsistentPdp(detail),
            SolverError::NoLocations => {
                ServiceError::bad_request("no valid locations found in request")
            }
        }
    }
}

impl From<crate::isochrone::IsochroneError> for ServiceError {
    fn from(err: crate::isochrone::IsochroneError) -> Self {
        match err {
            crate::isochrone::IsochroneError::Cache(cache) => cache.into(),
            crate::isochrone::IsochroneError::Cancelled => ServiceError::Internal,
        }
    }
}

impl From<SolveError> for ServiceError {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::Solver(inner) => inner.into(),
            // A cancelled build means the client is gone; nothing sensible
            // can be returned.
            SolveError::Cancelled(_) => ServiceError::Internal,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }

        // Unknown-mode rejections enumerate the allowed set so clients can
        // self-correct.
        let mut body = ApiError::new(self.to_string());
        if matches!(&self, ServiceError::BadRequest(msg) if msg.contains("transport mode")) {
            body.supported_modes = Some(SUPPORTED_MODES.iter().map(|m| m.to_string()).collect());
        }

        (status, Json(body)).into_response()
    }
}
