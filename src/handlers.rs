use crate::{
    catalog::Publication,
    errors::AppError,
    gate::OpenOutcome,
    models::{generate_slug, ApiResponse, ImageView},
    AppState,
};
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

/// Mutations are open when no admin token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(token) = state.config.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented.is_some_and(|p| tokens_match(p, token)) {
        Ok(())
    } else {
        tracing::warn!("Rejected mutation with missing or wrong admin token");
        Err(AppError::Unauthorized)
    }
}

/// Compares every byte so the time taken does not reveal how much of the token matched.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

fn view(state: &AppState, record: crate::models::ImageRecord) -> ImageView {
    ImageView::new(record, &state.config.thumbnail_size)
}

pub async fn list_images(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    tracing::debug!("Listing images via handler");
    let records = state.catalog.fetch_list().await?;
    let views: Vec<ImageView> = records.into_iter().map(|r| view(&state, r)).collect();
    Ok(Json(ApiResponse::ok(views)))
}

pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    tracing::debug!(%slug, "Fetching image details via handler");
    let record = state.catalog.fetch_by_slug(&slug).await?;
    Ok(Json(ApiResponse::ok(view(&state, record))))
}

/// Multipart upload: `title`, optional `slug`, `downloadUrl`, `description`,
/// `uploadedBy`, and the `image` file.
pub async fn create_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &headers)?;

    let mut title = None;
    let mut slug = None;
    let mut download_url = None;
    let mut description = None;
    let mut uploaded_by = None;
    let mut image_data: Option<Vec<u8>> = None;
    let mut image_filename: Option<String> = None;
    let mut image_content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        match field_name.as_str() {
            "title" => title = Some(field.text().await?),
            "slug" => slug = Some(field.text().await?),
            "downloadUrl" => download_url = Some(field.text().await?),
            "description" => description = Some(field.text().await?),
            "uploadedBy" => uploaded_by = Some(field.text().await?),
            "image" => {
                image_filename = field.file_name().map(|s| s.to_string());
                image_content_type = field.content_type().map(|m| m.to_string());
                image_data = Some(field.bytes().await?.to_vec());
            }
            _ => tracing::debug!("Ignoring unknown multipart field: {}", field_name),
        }
    }

    let title = title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::MissingFormField("title".to_string()))?;
    let slug = slug
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| generate_slug(&title));
    if slug.is_empty() {
        return Err(AppError::InvalidInput("slug cannot be derived from title".to_string()));
    }

    let image_data = image_data.ok_or_else(|| AppError::MissingFormField("image".to_string()))?;
    if image_data.is_empty() {
        return Err(AppError::InvalidInput("image data cannot be empty".to_string()));
    }

    let file_name = image_filename.unwrap_or_else(|| format!("{}.png", slug));
    let mime_type = image_content_type
        .filter(|ct| ct != "application/octet-stream")
        .or_else(|| mime_guess::from_path(&file_name).first_raw().map(|s| s.to_string()))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if !mime_type.starts_with("image/") {
        return Err(AppError::InvalidInput(format!("unsupported file type: {}", mime_type)));
    }

    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let record = state
        .catalog
        .publish(Publication {
            title,
            slug,
            download_url: non_empty(download_url),
            description: non_empty(description),
            uploaded_by: non_empty(uploaded_by),
            file_name,
            mime_type,
            data: image_data,
        })
        .await?;

    tracing::info!(id = %record.id, slug = %record.slug, "Image published via handler");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(view(&state, record)))))
}

pub async fn delete_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    authorize(&state, &headers)?;
    tracing::debug!(%id, "Deleting image via handler");
    state.catalog.delete_image(&id).await?;
    tracing::info!(%id, "Image deleted via handler");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    authorize(&state, &headers)?;
    state.catalog.invalidate_cache().await;
    Ok(StatusCode::NO_CONTENT)
}

/// Starts the countdown for a download page.
pub async fn start_download(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.catalog.fetch_by_slug(&slug).await?;
    let snapshot = state.gates.start(&record.slug, record.download());
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(snapshot))))
}

pub async fn gate_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ApiResponse::ok(state.gates.snapshot(id)?)))
}

pub async fn open_gate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ApiResponse::ok(state.gates.open(id)?)))
}

/// Called when the download page goes away; stops its countdown.
pub async fn close_gate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.gates.close(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(crate::errors::GateError::SessionNotFound(id).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct OutcomeReport {
    pub outcome: OpenOutcome,
}

pub async fn report_outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(report): Json<OutcomeReport>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(ApiResponse::ok(state.gates.report(id, report.outcome)?)))
}

pub async fn health() -> &'static str {
    "ok"
}
