//! The user-facing JSON web server routes. `POST /predict` pulls the image out
//! of the request and hands it to the classifier on the blocking pool.

use super::protocol::{self, B64Image, IMAGE_FIELD};
use super::WebError;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::{get, post, web, HttpRequest, Responder};
use base64::{engine::general_purpose, Engine as _};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, WebError>;

/// Health check. Never touches the model.
#[get("/")]
pub async fn health() -> impl Responder {
    web::Json(protocol::Health::OK)
}

#[post("/predict")]
pub async fn predict(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<impl Responder> {
    let image = read_image(&req, payload, state.max_upload_bytes).await?;
    debug!("received image of {} bytes", image.len());

    let result = web::block(move || state.classify(&image)).await??;

    info!("predicted {} ({}%)", result.prediction, result.confidence);
    Ok(web::Json(result))
}

/// Extract the uploaded image bytes from a multipart form or a JSON body
async fn read_image(req: &HttpRequest, payload: web::Payload, limit: usize) -> Result<Vec<u8>> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        read_multipart(Multipart::new(req.headers(), payload), limit).await
    } else if content_type.starts_with("application/json") {
        read_json(payload, limit).await
    } else {
        Err(WebError::MissingImage)
    }
}

/// The first file part named `image`. Parts without a filename are plain
/// form values, not uploads.
async fn read_multipart(mut form: Multipart, limit: usize) -> Result<Vec<u8>> {
    while let Some(mut field) = form.try_next().await? {
        let disposition = field.content_disposition();
        if disposition.get_name() != Some(IMAGE_FIELD) || disposition.get_filename().is_none() {
            continue;
        }

        let mut image = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if image.len() + chunk.len() > limit {
                return Err(WebError::TooLarge(limit));
            }
            image.extend_from_slice(&chunk);
        }
        return Ok(image);
    }
    Err(WebError::MissingImage)
}

async fn read_json(mut payload: web::Payload, limit: usize) -> Result<Vec<u8>> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        // base 64 inflates by 4/3
        if body.len() + chunk.len() > limit / 3 * 4 + 1024 {
            return Err(WebError::TooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }

    let upload: B64Image = serde_json::from_slice(&body)?;
    if upload.image.is_none() {
        return Err(WebError::MissingImage);
    }
    let data = upload
        .payload()
        .ok_or_else(|| WebError::Malformed("data URL without payload".to_string()))?;
    let image = general_purpose::STANDARD.decode(data.trim())?;
    if image.len() > limit {
        return Err(WebError::TooLarge(limit));
    }
    Ok(image)
}
