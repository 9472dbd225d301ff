use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::tag::Tag;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Image {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_path: String,
    pub mime_type: String,
    pub file_size: i64,
    pub width: i32,
    pub height: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional 1:1 child of an image. `taken_at` drives the capture-time filter.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ImageExif {
    pub image_id: Uuid,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Thumbnail {
    pub image_id: Uuid,
    pub storage_key: String,
    pub width: i32,
    pub height: i32,
    pub size: i64,
}

/// An image row with its eager-loaded children attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageWithAssociations {
    pub image: Image,
    pub tags: Vec<Tag>,
    pub exif: Option<ImageExif>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Serialize)]
pub struct ThumbnailResponse {
    pub url: String,
    pub width: i32,
    pub height: i32,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: i64,
    pub width: i32,
    pub height: i32,
    pub file_url: String,
    pub thumbnail: Option<ThumbnailResponse>,
    pub exif: Option<ImageExif>,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub items: Vec<ImageResponse>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Deserialize)]
pub struct ImportVerifyRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub username: String,
    pub password: String,
    pub image_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ImportVerifyResponse {
    pub user_id: Uuid,
    pub images: Vec<ImageResponse>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub imported: Vec<ImageResponse>,
}

impl ImageWithAssociations {
    pub fn into_response(self, storage: &StorageBackend) -> ImageResponse {
        let Self {
            image,
            tags,
            exif,
            thumbnail,
        } = self;

        ImageResponse {
            id: image.id,
            user_id: image.user_id,
            file_url: storage.public_url(&image.file_path),
            original_filename: image.original_filename,
            mime_type: image.mime_type,
            file_size: image.file_size,
            width: image.width,
            height: image.height,
            thumbnail: thumbnail.map(|t| ThumbnailResponse {
                url: storage.public_url(&t.storage_key),
                width: t.width,
                height: t.height,
                size: t.size,
            }),
            exif,
            tags,
            created_at: image.created_at,
            updated_at: image.updated_at,
        }
    }
}
