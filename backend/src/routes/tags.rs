use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::AppError;
use crate::models::tag::{
    AddImageTagRequest, AssignImageTagsRequest, CreateTagRequest, SetImageTagsRequest,
    SwapImageTagRequest, Tag, UpdateTagColorRequest,
};
use crate::search::store::escape_like;
use crate::AppState;

const MAX_TAG_NAME_CHARS: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tags", get(list_tags).post(create_tag))
        .route("/api/tags/{id}", delete(delete_tag))
        .route("/api/tags/{id}/color", put(update_color))
        .route("/api/images/{id}/tags", post(assign_image_tags).put(set_image_tags))
        .route("/api/images/{id}/tags/add", post(add_image_tag))
        .route("/api/images/{id}/tags/update", put(swap_image_tag))
        .route("/api/images/{id}/tags/{tag_id}", delete(remove_image_tag))
}

pub(crate) fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_TAG_NAME_CHARS {
        return Err(AppError::BadRequest(format!(
            "Tag name must be 1-{MAX_TAG_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Colors are either empty (uncolored) or `#RRGGBB`.
fn validate_color(color: &str) -> Result<String, AppError> {
    let color = color.trim();
    let valid = color.is_empty()
        || (color.len() == 7
            && color.starts_with('#')
            && color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(AppError::BadRequest(
            "Color must be empty or in #RRGGBB form".into(),
        ));
    }
    Ok(color.to_string())
}

/// Fetch the owner's tag by exact name, creating it with `color` if missing.
pub(crate) async fn find_or_create_tag<'e>(
    db: impl PgExecutor<'e>,
    owner: Uuid,
    name: &str,
    color: &str,
) -> Result<Tag, AppError> {
    let tag = sqlx::query_as::<_, Tag>(
        "INSERT INTO tags (user_id, name, color) VALUES ($1, $2, $3)
         ON CONFLICT (user_id, name) DO UPDATE SET name = EXCLUDED.name
         RETURNING id, user_id, name, color, created_at",
    )
    .bind(owner)
    .bind(name)
    .bind(color)
    .fetch_one(db)
    .await?;
    Ok(tag)
}

pub(crate) async fn link_tag<'e>(
    db: impl PgExecutor<'e>,
    image_id: Uuid,
    tag_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("INSERT INTO image_tags (image_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(image_id)
        .bind(tag_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Associate tags by name with an image, creating uncolored tags as needed.
pub(crate) async fn assign_tags_by_name(
    conn: &mut PgConnection,
    owner: Uuid,
    image_id: Uuid,
    names: &[String],
) -> Result<(), AppError> {
    for name in names {
        let name = validate_name(name)?;
        let tag = find_or_create_tag(&mut *conn, owner, &name, "").await?;
        link_tag(&mut *conn, image_id, tag.id).await?;
    }
    Ok(())
}

/// Deduplicated tag ids for a bulk assignment; at least one is required.
fn requested_tag_ids(ids: &[Uuid]) -> Result<Vec<Uuid>, AppError> {
    let ids: Vec<Uuid> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if ids.is_empty() {
        return Err(AppError::BadRequest("At least one tag is required".into()));
    }
    Ok(ids)
}

async fn ensure_image_owned(db: &PgPool, owner: Uuid, image_id: Uuid) -> Result<(), AppError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM images WHERE id = $1 AND user_id = $2)")
            .bind(image_id)
            .bind(owner)
            .fetch_one(db)
            .await?;
    if !exists {
        return Err(AppError::NotFound("Image not found".into()));
    }
    Ok(())
}

async fn image_tags(db: &PgPool, image_id: Uuid) -> Result<Vec<Tag>, AppError> {
    let tags = sqlx::query_as::<_, Tag>(
        "SELECT t.id, t.user_id, t.name, t.color, t.created_at
         FROM tags t
         JOIN image_tags it ON it.tag_id = t.id
         WHERE it.image_id = $1
         ORDER BY t.name",
    )
    .bind(image_id)
    .fetch_all(db)
    .await?;
    Ok(tags)
}

#[derive(Debug, Deserialize)]
struct ListTagsParams {
    q: Option<String>,
}

async fn list_tags(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListTagsParams>,
) -> Result<Json<Vec<Tag>>, AppError> {
    let q = params.q.unwrap_or_default().trim().to_string();

    let tags = if q.is_empty() {
        sqlx::query_as::<_, Tag>(
            "SELECT id, user_id, name, color, created_at FROM tags
             WHERE user_id = $1 ORDER BY name",
        )
        .bind(auth.user_id)
        .fetch_all(&state.db)
        .await?
    } else {
        // Prefix search
        sqlx::query_as::<_, Tag>(
            "SELECT id, user_id, name, color, created_at FROM tags
             WHERE user_id = $1 AND name LIKE $2 ORDER BY name",
        )
        .bind(auth.user_id)
        .bind(format!("{}%", escape_like(&q)))
        .fetch_all(&state.db)
        .await?
    };

    Ok(Json(tags))
}

async fn create_tag(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateTagRequest>,
) -> Result<Json<Tag>, AppError> {
    let name = validate_name(&body.name)?;
    let color = validate_color(&body.color)?;

    let tag = sqlx::query_as::<_, Tag>(
        "INSERT INTO tags (user_id, name, color) VALUES ($1, $2, $3)
         RETURNING id, user_id, name, color, created_at",
    )
    .bind(auth.user_id)
    .bind(&name)
    .bind(&color)
    .fetch_one(&state.db)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Tag already exists"))?;

    Ok(Json(tag))
}

async fn update_color(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTagColorRequest>,
) -> Result<Json<Tag>, AppError> {
    let color = validate_color(&body.color)?;

    let tag = sqlx::query_as::<_, Tag>(
        "UPDATE tags SET color = $1 WHERE id = $2 AND user_id = $3
         RETURNING id, user_id, name, color, created_at",
    )
    .bind(&color)
    .bind(id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound("Tag not found".into()))?;

    Ok(Json(tag))
}

async fn delete_tag(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let result = sqlx::query("DELETE FROM tags WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(auth.user_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Tag not found".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn add_image_tag(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<AddImageTagRequest>,
) -> Result<Json<Vec<Tag>>, AppError> {
    ensure_image_owned(&state.db, auth.user_id, id).await?;

    let mut tx = state.db.begin().await?;
    assign_tags_by_name(&mut tx, auth.user_id, id, &[body.tag_name]).await?;
    tx.commit().await?;

    Ok(Json(image_tags(&state.db, id).await?))
}

async fn set_image_tags(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<SetImageTagsRequest>,
) -> Result<Json<Vec<Tag>>, AppError> {
    ensure_image_owned(&state.db, auth.user_id, id).await?;

    let names = body
        .tags
        .iter()
        .map(|name| validate_name(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut tx = state.db.begin().await?;
    sqlx::query("DELETE FROM image_tags WHERE image_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    for name in &names {
        let tag = find_or_create_tag(&mut *tx, auth.user_id, name, "").await?;
        link_tag(&mut *tx, id, tag.id).await?;
    }
    tx.commit().await?;

    Ok(Json(image_tags(&state.db, id).await?))
}

/// Attach existing tags by id. Every id must name one of the caller's tags.
async fn assign_image_tags(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<AssignImageTagsRequest>,
) -> Result<Json<Vec<Tag>>, AppError> {
    ensure_image_owned(&state.db, auth.user_id, id).await?;
    let tag_ids = requested_tag_ids(&body.tag_ids)?;

    let mut tx = state.db.begin().await?;
    let owned: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE user_id = $1 AND id = ANY($2)")
            .bind(auth.user_id)
            .bind(&tag_ids)
            .fetch_one(&mut *tx)
            .await?;
    if owned != tag_ids.len() as i64 {
        return Err(AppError::NotFound("Tag not found".into()));
    }
    for tag_id in &tag_ids {
        link_tag(&mut *tx, id, *tag_id).await?;
    }
    tx.commit().await?;

    Ok(Json(image_tags(&state.db, id).await?))
}

/// Replace one tag on an image with a tag named `new_tag_name`. A missing
/// tag is created with the old tag's color.
async fn swap_image_tag(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<SwapImageTagRequest>,
) -> Result<Json<Vec<Tag>>, AppError> {
    ensure_image_owned(&state.db, auth.user_id, id).await?;
    let name = validate_name(&body.new_tag_name)?;

    let mut tx = state.db.begin().await?;
    let old = sqlx::query_as::<_, Tag>(
        "SELECT id, user_id, name, color, created_at FROM tags WHERE id = $1 AND user_id = $2",
    )
    .bind(body.old_tag_id)
    .bind(auth.user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::NotFound("Tag not found".into()))?;

    let new = find_or_create_tag(&mut *tx, auth.user_id, &name, &old.color).await?;
    sqlx::query("DELETE FROM image_tags WHERE image_id = $1 AND tag_id = $2")
        .bind(id)
        .bind(old.id)
        .execute(&mut *tx)
        .await?;
    link_tag(&mut *tx, id, new.id).await?;
    tx.commit().await?;

    tracing::debug!(image_id = %id, from = %old.name, to = %new.name, "swapped image tag");
    Ok(Json(image_tags(&state.db, id).await?))
}

async fn remove_image_tag(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, tag_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    ensure_image_owned(&state.db, auth.user_id, id).await?;

    let result = sqlx::query("DELETE FROM image_tags WHERE image_id = $1 AND tag_id = $2")
        .bind(id)
        .bind(tag_id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Tag not attached to image".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}
