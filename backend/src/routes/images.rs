use std::collections::BTreeSet;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::AppError;
use crate::metadata::ExtractedExif;
use crate::models::image::{
    Image, ImageListResponse, ImageResponse, ImageWithAssociations, ImportRequest, ImportResponse,
    ImportVerifyRequest, ImportVerifyResponse,
};
use crate::routes::auth::authenticate;
use crate::routes::tags::{assign_tags_by_name, find_or_create_tag, link_tag, validate_name};
use crate::search::filter::parse_tag_string;
use crate::search::{self, Paging, SearchParams};
use crate::storage::{original_key, thumbnail_key, StagedBlobs};
use crate::AppState;

const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
];

// Multipart framing around the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const IMAGE_COLUMNS: &str = "id, user_id, original_filename, stored_filename, file_path, \
    mime_type, file_size, width, height, created_at, updated_at";

fn extension_from_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}

pub fn router(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        .route("/api/images/upload", post(upload))
        .route(
            "/api/images/{id}",
            get(get_image).put(replace_file).delete(delete_image),
        )
        .route_layer(DefaultBodyLimit::max(max_upload_size + MULTIPART_OVERHEAD))
        .route("/api/images", get(list_images))
        .route("/api/images/import/verify", post(import_verify))
        .route("/api/images/import", post(import))
}

#[derive(Debug, Default, Deserialize)]
struct PageParams {
    page: Option<i64>,
    #[serde(alias = "pageSize")]
    page_size: Option<i64>,
}

impl PageParams {
    fn paging(&self) -> Paging {
        Paging::new(self.page.unwrap_or(1), self.page_size.unwrap_or(0))
    }
}

async fn list_images(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<SearchParams>,
    Query(page): Query<PageParams>,
) -> Result<Json<ImageListResponse>, AppError> {
    let paging = page.paging();
    let result = search::search(&state.image_store, auth.user_id, &params, paging).await?;

    Ok(Json(ImageListResponse {
        items: result
            .items
            .into_iter()
            .map(|i| i.into_response(&state.storage))
            .collect(),
        total: result.total,
        page: paging.page,
        page_size: paging.page_size,
    }))
}

async fn load_owned(
    state: &AppState,
    owner: Uuid,
    id: Uuid,
) -> Result<ImageWithAssociations, AppError> {
    search::find_image(&state.image_store, owner, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Image not found".into()))
}

async fn get_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ImageResponse>, AppError> {
    let image = load_owned(&state, auth.user_id, id).await?;
    Ok(Json(image.into_response(&state.storage)))
}

async fn delete_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let image = load_owned(&state, auth.user_id, id).await?;

    sqlx::query("DELETE FROM images WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(auth.user_id)
        .execute(&state.db)
        .await?;

    // Blobs go last; a leftover file is harmless, a dangling row is not.
    state.storage.delete(&image.image.file_path).await;
    if let Some(thumbnail) = &image.thumbnail {
        state.storage.delete(&thumbnail.storage_key).await;
    }

    tracing::info!(image_id = %id, "deleted image");
    Ok(StatusCode::NO_CONTENT)
}

struct NewImage<'a> {
    original_filename: &'a str,
    stored_filename: &'a str,
    mime_type: &'a str,
    file_size: i64,
    width: i32,
    height: i32,
}

async fn insert_image<'e>(
    db: impl PgExecutor<'e>,
    owner: Uuid,
    new: &NewImage<'_>,
) -> Result<Image, AppError> {
    let image = sqlx::query_as::<_, Image>(&format!(
        "INSERT INTO images
            (user_id, original_filename, stored_filename, file_path, mime_type, file_size, width, height)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING {IMAGE_COLUMNS}"
    ))
    .bind(owner)
    .bind(new.original_filename)
    .bind(new.stored_filename)
    .bind(original_key(new.stored_filename))
    .bind(new.mime_type)
    .bind(new.file_size)
    .bind(new.width)
    .bind(new.height)
    .fetch_one(db)
    .await?;
    Ok(image)
}

async fn save_exif<'e>(
    db: impl PgExecutor<'e>,
    image_id: Uuid,
    exif: &ExtractedExif,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO image_exifs (image_id, camera_make, camera_model, taken_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (image_id) DO UPDATE SET
            camera_make = EXCLUDED.camera_make,
            camera_model = EXCLUDED.camera_model,
            taken_at = EXCLUDED.taken_at",
    )
    .bind(image_id)
    .bind(&exif.camera_make)
    .bind(&exif.camera_model)
    .bind(exif.taken_at)
    .execute(db)
    .await?;
    Ok(())
}

async fn save_thumbnail_row<'e>(
    db: impl PgExecutor<'e>,
    image_id: Uuid,
    key: &str,
    width: i32,
    height: i32,
    size: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO image_thumbnails (image_id, storage_key, width, height, size)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (image_id) DO UPDATE SET
            storage_key = EXCLUDED.storage_key,
            width = EXCLUDED.width,
            height = EXCLUDED.height,
            size = EXCLUDED.size",
    )
    .bind(image_id)
    .bind(key)
    .bind(width)
    .bind(height)
    .bind(size)
    .execute(db)
    .await?;
    Ok(())
}

/// Keep the staged blobs if the database side succeeded, remove them otherwise.
async fn commit_or_discard<T>(
    staged: StagedBlobs<'_>,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            staged.keep();
            Ok(value)
        }
        Err(e) => {
            staged.discard().await;
            Err(e)
        }
    }
}

/// Decode and store a thumbnail. Failures are logged, never surfaced.
async fn generate_thumbnail(
    state: &AppState,
    image_id: Uuid,
    stored_filename: &str,
    bytes: Vec<u8>,
) {
    let result = tokio::task::spawn_blocking(move || crate::thumbnails::generate(&bytes)).await;
    let thumb = match result {
        Ok(Ok(thumb)) => thumb,
        Ok(Err(e)) => {
            tracing::warn!(image_id = %image_id, "Thumbnail generation failed: {e}");
            return;
        }
        Err(e) => {
            tracing::warn!(image_id = %image_id, "Thumbnail task panicked: {e}");
            return;
        }
    };

    let key = thumbnail_key(stored_filename);
    let mut staged = StagedBlobs::new(&state.storage);
    let result = async {
        staged.put(key.clone(), &thumb.bytes).await?;
        save_thumbnail_row(
            &state.db,
            image_id,
            &key,
            thumb.width as i32,
            thumb.height as i32,
            thumb.bytes.len() as i64,
        )
        .await
    }
    .await;

    if let Err(e) = commit_or_discard(staged, result).await {
        tracing::warn!(image_id = %image_id, "Failed to store thumbnail: {e}");
    }
}

struct UploadForm {
    filename: String,
    mime_type: String,
    bytes: Vec<u8>,
    tags: Vec<String>,
}

/// Tag names from `tags` and `tags[]` fields. Every value goes through the
/// same comma splitting as search, so stored names stay searchable.
fn upload_tag_names(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| parse_tag_string(value))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut tag_values: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();

        match field_name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let mime = field
                    .content_type()
                    .ok_or_else(|| AppError::BadRequest("File missing content type".into()))?
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read file: {e}")))?;
                file = Some((filename, mime, bytes.to_vec()));
            }
            "tags" | "tags[]" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read tags: {e}")))?;
                tag_values.push(text);
            }
            _ => {}
        }
    }

    let (filename, mime_type, bytes) =
        file.ok_or_else(|| AppError::BadRequest("No file provided".into()))?;

    Ok(UploadForm {
        filename,
        mime_type,
        bytes,
        tags: upload_tag_names(&tag_values),
    })
}

fn check_upload(mime: &str, size: usize, max_size: usize) -> Result<(), AppError> {
    if !ALLOWED_MIME_TYPES.contains(&mime) {
        return Err(AppError::BadRequest(format!("Unsupported file type: {mime}")));
    }
    if size == 0 {
        return Err(AppError::BadRequest("Empty file".into()));
    }
    if size > max_size {
        return Err(AppError::BadRequest(format!(
            "File exceeds the {max_size} byte limit"
        )));
    }
    Ok(())
}

/// Validate an uploaded file and read its pixel size.
fn inspect_upload(form: &UploadForm, max_size: usize) -> Result<(i32, i32), AppError> {
    check_upload(&form.mime_type, form.bytes.len(), max_size)?;
    crate::thumbnails::dimensions(&form.bytes)
        .ok_or_else(|| AppError::BadRequest("Could not read image dimensions".into()))
}

fn new_stored_filename(mime: &str) -> String {
    format!("{}.{}", Uuid::new_v4(), extension_from_mime(mime))
}

async fn upload(
    State(state): State<AppState>,
    auth: AuthUser,
    multipart: Multipart,
) -> Result<Json<ImageResponse>, AppError> {
    let form = read_upload_form(multipart).await?;
    let (width, height) = inspect_upload(&form, state.config.max_upload_size)?;
    for name in &form.tags {
        validate_name(name)?;
    }

    let stored_filename = new_stored_filename(&form.mime_type);
    let exif = crate::metadata::extract(&form.bytes);

    let mut staged = StagedBlobs::new(&state.storage);
    let result = async {
        staged.put(original_key(&stored_filename), &form.bytes).await?;

        let mut tx = state.db.begin().await?;
        let image = insert_image(
            &mut *tx,
            auth.user_id,
            &NewImage {
                original_filename: &form.filename,
                stored_filename: &stored_filename,
                mime_type: &form.mime_type,
                file_size: form.bytes.len() as i64,
                width,
                height,
            },
        )
        .await?;
        if let Some(exif) = &exif {
            save_exif(&mut *tx, image.id, exif).await?;
        }
        assign_tags_by_name(&mut tx, auth.user_id, image.id, &form.tags).await?;
        tx.commit().await?;
        Ok::<_, AppError>(image)
    }
    .await;
    let image = commit_or_discard(staged, result).await?;

    tracing::info!(image_id = %image.id, size = image.file_size, "uploaded {}", image.original_filename);
    generate_thumbnail(&state, image.id, &image.stored_filename, form.bytes).await;

    let image = load_owned(&state, auth.user_id, image.id).await?;
    Ok(Json(image.into_response(&state.storage)))
}

/// Swap an image's file in place. Tags and the original filename survive;
/// dimensions, type, size, EXIF and thumbnail follow the new file.
async fn replace_file(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Json<ImageResponse>, AppError> {
    let current = load_owned(&state, auth.user_id, id).await?;
    let form = read_upload_form(multipart).await?;
    let (width, height) = inspect_upload(&form, state.config.max_upload_size)?;

    let stored_filename = new_stored_filename(&form.mime_type);
    let exif = crate::metadata::extract(&form.bytes);

    let mut staged = StagedBlobs::new(&state.storage);
    let result = async {
        staged.put(original_key(&stored_filename), &form.bytes).await?;

        let mut tx = state.db.begin().await?;
        let image = sqlx::query_as::<_, Image>(&format!(
            "UPDATE images SET
                stored_filename = $1, file_path = $2, mime_type = $3,
                file_size = $4, width = $5, height = $6, updated_at = now()
             WHERE id = $7 AND user_id = $8
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(&stored_filename)
        .bind(original_key(&stored_filename))
        .bind(&form.mime_type)
        .bind(form.bytes.len() as i64)
        .bind(width)
        .bind(height)
        .bind(id)
        .bind(auth.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Image not found".into()))?;

        sqlx::query("DELETE FROM image_thumbnails WHERE image_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        match &exif {
            Some(exif) => save_exif(&mut *tx, id, exif).await?,
            None => {
                sqlx::query("DELETE FROM image_exifs WHERE image_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok::<_, AppError>(image)
    }
    .await;
    let image = commit_or_discard(staged, result).await?;

    state.storage.delete(&current.image.file_path).await;
    if let Some(thumbnail) = &current.thumbnail {
        state.storage.delete(&thumbnail.storage_key).await;
    }
    generate_thumbnail(&state, image.id, &image.stored_filename, form.bytes).await;

    tracing::info!(image_id = %id, size = image.file_size, "replaced image file");
    let image = load_owned(&state, auth.user_id, id).await?;
    Ok(Json(image.into_response(&state.storage)))
}

/// Resolve the source account of an import, refusing the caller's own.
async fn import_source(
    db: &PgPool,
    auth: &AuthUser,
    username: &str,
    password: &str,
) -> Result<Uuid, AppError> {
    let source = authenticate(db, username, password).await?;
    if source.id == auth.user_id {
        return Err(AppError::BadRequest("Cannot import from your own account".into()));
    }
    Ok(source.id)
}

async fn import_verify(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<ImportVerifyRequest>,
) -> Result<Json<ImportVerifyResponse>, AppError> {
    let source = import_source(&state.db, &auth, &body.username, &body.password).await?;
    let images = search::library(&state.image_store, source).await?;

    Ok(Json(ImportVerifyResponse {
        user_id: source,
        images: images
            .into_iter()
            .map(|i| i.into_response(&state.storage))
            .collect(),
    }))
}

/// Copy one image with its blob, EXIF, thumbnail and tags into `owner`'s
/// library. Either the whole copy lands or nothing of it does.
async fn copy_image(
    state: &AppState,
    owner: Uuid,
    source: &ImageWithAssociations,
) -> Result<Uuid, AppError> {
    let src = &source.image;
    let bytes = state.storage.get(&src.file_path).await?;
    let thumbnail = match &source.thumbnail {
        Some(thumbnail) => Some((thumbnail, state.storage.get(&thumbnail.storage_key).await?)),
        None => None,
    };

    let stored_filename = new_stored_filename(&src.mime_type);
    let mut staged = StagedBlobs::new(&state.storage);
    let result = async {
        staged.put(original_key(&stored_filename), &bytes).await?;
        if let Some((_, thumb_bytes)) = &thumbnail {
            staged.put(thumbnail_key(&stored_filename), thumb_bytes).await?;
        }

        let mut tx = state.db.begin().await?;
        let image = insert_image(
            &mut *tx,
            owner,
            &NewImage {
                original_filename: &src.original_filename,
                stored_filename: &stored_filename,
                mime_type: &src.mime_type,
                file_size: src.file_size,
                width: src.width,
                height: src.height,
            },
        )
        .await?;

        if let Some(exif) = &source.exif {
            let exif = ExtractedExif {
                camera_make: exif.camera_make.clone(),
                camera_model: exif.camera_model.clone(),
                taken_at: exif.taken_at,
            };
            save_exif(&mut *tx, image.id, &exif).await?;
        }

        if let Some((thumb, thumb_bytes)) = &thumbnail {
            save_thumbnail_row(
                &mut *tx,
                image.id,
                &thumbnail_key(&stored_filename),
                thumb.width,
                thumb.height,
                thumb_bytes.len() as i64,
            )
            .await?;
        }

        for tag in &source.tags {
            let own = find_or_create_tag(&mut *tx, owner, &tag.name, &tag.color).await?;
            link_tag(&mut *tx, image.id, own.id).await?;
        }

        tx.commit().await?;
        Ok::<_, AppError>(image.id)
    }
    .await;
    let id = commit_or_discard(staged, result).await?;

    if thumbnail.is_none() {
        generate_thumbnail(state, id, &stored_filename, bytes).await;
    }
    Ok(id)
}

async fn import(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, AppError> {
    let source = import_source(&state.db, &auth, &body.username, &body.password).await?;
    let originals = search::find_images(&state.image_store, source, body.image_ids).await?;

    let mut copied = Vec::with_capacity(originals.len());
    for original in &originals {
        match copy_image(&state, auth.user_id, original).await {
            Ok(id) => copied.push(id),
            Err(e) => {
                tracing::warn!(source_image = %original.image.id, "Import of image failed: {e}");
            }
        }
    }
    tracing::info!(count = copied.len(), from = %source, "imported images");

    let imported = search::find_images(&state.image_store, auth.user_id, copied).await?;
    Ok(Json(ImportResponse {
        imported: imported
            .into_iter()
            .map(|i| i.into_response(&state.storage))
            .collect(),
    }))
}
