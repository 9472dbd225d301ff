use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user-owned label. An empty `color` means the tag is uncolored.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Tag {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTagRequest {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTagColorRequest {
    pub color: String,
}

#[derive(Debug, Deserialize)]
pub struct AddImageTagRequest {
    pub tag_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetImageTagsRequest {
    pub tags: Vec<String>,
}

/// Attach existing tags by id.
#[derive(Debug, Deserialize)]
pub struct AssignImageTagsRequest {
    #[serde(alias = "tagIds")]
    pub tag_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SwapImageTagRequest {
    #[serde(alias = "oldTagId")]
    pub old_tag_id: Uuid,
    #[serde(alias = "newTagName")]
    pub new_tag_name: String,
}
