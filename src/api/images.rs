use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rocket::http::{ContentType, Header, Status};
use rocket::serde::json::Json;
use rocket::State;
use rocket::{request::Request, response::{self, Responder, Response}};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::blobs::{is_object_url, BlobRegistry};
use crate::cache::CompressionStats;
use crate::config::AppConfig;
use crate::interceptor::{ImageCompressionService, ImageElement, ImageTarget, LoaderSlot};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedImage {
    pub original: String,
    pub src: String,
    pub compressed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveBatch {
    pub srcs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: CompressionStats,
    pub savings_percent: f64,
    pub running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OptOutResponse {
    pub url: String,
}

// Assign a URL to a fresh element and wait for whatever source it settles on
async fn resolve(slot: &LoaderSlot, src: &str, timeout: Duration) -> Result<ResolvedImage, ApiError> {
    if src.trim().is_empty() {
        return Err(ApiError::BadRequest("src must not be empty".to_string()));
    }

    let element = Arc::new(ImageElement::new());
    slot.assign(element.clone(), src);

    let resolved = match tokio::time::timeout(timeout, element.loaded()).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => element.src().unwrap_or_else(|| src.to_string()),
        Err(_) => {
            log::warn!("Timed out resolving image source for {}", src);
            return Err(ApiError::Timeout(format!("No source settled for '{}' within {:?}", src, timeout)));
        }
    };

    Ok(ResolvedImage {
        original: src.to_string(),
        compressed: is_object_url(&resolved),
        src: resolved,
    })
}

#[get("/resolve?<src>")]
pub async fn resolve_image(
    src: String,
    slot: &State<Arc<LoaderSlot>>,
    config: &State<AppConfig>,
) -> Result<Json<ResolvedImage>, ApiError> {
    log::debug!("Resolving image source for {}", src);
    let resolved = resolve(slot, &src, Duration::from_secs(config.timeout)).await?;
    Ok(Json(resolved))
}

#[post("/resolve", format = "json", data = "<batch>")]
pub async fn resolve_images(
    batch: Json<ResolveBatch>,
    slot: &State<Arc<LoaderSlot>>,
    config: &State<AppConfig>,
) -> Result<Json<Vec<ResolvedImage>>, ApiError> {
    let timeout = Duration::from_secs(config.timeout);
    let slot: &LoaderSlot = slot;
    let results = join_all(batch.srcs.iter().map(|src| resolve(slot, src, timeout))).await;
    let resolved = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    Ok(Json(resolved))
}

#[get("/stats")]
pub fn get_stats(service: &State<ImageCompressionService>) -> Json<StatsResponse> {
    let stats = service.stats();
    Json(StatsResponse {
        savings_percent: stats.savings_percent(),
        running: service.is_running(),
        stats,
    })
}

#[get("/opt-out?<src>")]
pub fn opt_out_url(src: String, service: &State<ImageCompressionService>) -> Json<OptOutResponse> {
    Json(OptOutResponse {
        url: service.opt_out(&src),
    })
}

#[get("/<id>")]
pub fn get_blob(id: &str, blobs: &State<Arc<BlobRegistry>>) -> Result<BlobResponse, ApiError> {
    match blobs.get_by_id(id) {
        Some(blob) => Ok(BlobResponse {
            data: blob.data,
            content_type: blob.content_type,
        }),
        None => Err(ApiError::NotFound(format!("Blob '{}' does not exist or was revoked", id))),
    }
}

pub struct BlobResponse {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl<'r> Responder<'r, 'static> for BlobResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let content_type = ContentType::parse_flexible(&self.content_type).unwrap_or(ContentType::JPEG);
        let etag = format!("\"{:x}\"", md5::compute(&self.data));
        // Handles are immutable, so a matching ETag is always still valid
        if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
            if if_none_match == etag {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag))
                    .header(Header::new("Cache-Control", "private, max-age=86400, immutable"))
                    .ok();
            }
        }
        Response::build()
            .header(content_type)
            .header(Header::new("Cache-Control", "private, max-age=86400, immutable"))
            .header(Header::new("ETag", etag))
            .sized_body(self.data.len(), Cursor::new(self.data))
            .ok()
    }
}
