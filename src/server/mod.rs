//! The HTTP surface: a health check and the prediction route.

use crate::error::PredictError;
use crate::state::AppState;
use actix_cors::Cors;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{middleware, web, HttpResponse};
use thiserror::Error;
use tracing::{error, warn};

pub mod protocol;
pub mod routes;

/// Register the shared state, any-origin CORS, the access log and both
/// routes. Used by `main` for every worker and by the route tests.
pub fn configure(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(state).service(
            web::scope("")
                .wrap(Cors::permissive())
                .wrap(middleware::Logger::default())
                .service(routes::health)
                .service(routes::predict),
        );
    }
}

/// Every way a request can fail, mapped onto a status code by
/// `ResponseError`. The body is always `{"error": <message>}`.
#[derive(Debug, Error)]
pub enum WebError {
    #[error("No image uploaded")]
    MissingImage,

    #[error("upload exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed upload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error("inference task was cancelled")]
    Blocking,
}

impl WebError {
    fn message(&self) -> String {
        match self {
            // keep the checkpoint path out of responses
            WebError::Predict(PredictError::Load(_)) => "Model unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            warn!("rejected request: {self}");
        }

        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .json(protocol::ErrorBody {
                error: self.message(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            WebError::MissingImage | WebError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            WebError::Predict(PredictError::Decode(_)) => StatusCode::BAD_REQUEST,
            WebError::Predict(PredictError::Load(_)) => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Predict(_) | WebError::Blocking => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<actix_multipart::MultipartError> for WebError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        WebError::Malformed(err.to_string())
    }
}

impl From<actix_web::error::PayloadError> for WebError {
    fn from(err: actix_web::error::PayloadError) -> Self {
        WebError::Malformed(err.to_string())
    }
}

impl From<base64::DecodeError> for WebError {
    fn from(err: base64::DecodeError) -> Self {
        WebError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for WebError {
    fn from(err: serde_json::Error) -> Self {
        WebError::Malformed(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for WebError {
    fn from(_: actix_web::error::BlockingError) -> Self {
        WebError::Blocking
    }
}
