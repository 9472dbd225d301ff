//! In-memory `ImageStore` used by the engine's tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::image::{Image, ImageExif, ImageWithAssociations, Thumbnail};
use crate::models::tag::Tag;

use super::compose::{KeyQuery, Predicates, Scope};
use super::filter::Mode;
use super::store::ImageStore;

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub image: Image,
    pub tag_names: Vec<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub has_exif: bool,
}

impl StoredImage {
    pub fn new(owner: Uuid, filename: &str) -> Self {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        Self {
            image: Image {
                id: Uuid::new_v4(),
                user_id: owner,
                original_filename: filename.to_string(),
                stored_filename: format!("{filename}.stored"),
                file_path: format!("originals/{filename}"),
                mime_type: "image/jpeg".to_string(),
                file_size: 1024,
                width: 640,
                height: 480,
                created_at: created,
                updated_at: created,
            },
            tag_names: vec![],
            taken_at: None,
            has_exif: false,
        }
    }

    pub fn tagged(mut self, names: &[&str]) -> Self {
        self.tag_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.image.created_at = at;
        self
    }

    pub fn created_minutes_ago(self, minutes: i64) -> Self {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        self.created(base - Duration::minutes(minutes))
    }

    pub fn size(mut self, bytes: i64) -> Self {
        self.image.file_size = bytes;
        self
    }

    pub fn dimensions(mut self, width: i32, height: i32) -> Self {
        self.image.width = width;
        self.image.height = height;
        self
    }

    pub fn taken(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.taken_at = at;
        self.has_exif = true;
        self
    }
}

#[derive(Default)]
pub struct MemoryStore {
    images: Mutex<Vec<StoredImage>>,
    tags: Mutex<Vec<Tag>>,
    key_queries: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    /// Insert an image, creating any of its tags missing from the owner's catalog.
    pub fn insert(&self, stored: StoredImage) -> Uuid {
        let owner = stored.image.user_id;
        for name in &stored.tag_names {
            self.ensure_tag(owner, name);
        }
        let id = stored.image.id;
        self.images.lock().unwrap().push(stored);
        id
    }

    pub fn ensure_tag(&self, owner: Uuid, name: &str) {
        let mut tags = self.tags.lock().unwrap();
        if !tags.iter().any(|t| t.user_id == owner && t.name == name) {
            tags.push(Tag {
                id: Uuid::new_v4(),
                user_id: owner,
                name: name.to_string(),
                color: String::new(),
                created_at: Utc::now(),
            });
        }
    }

    pub fn key_queries(&self) -> usize {
        self.key_queries.load(Ordering::SeqCst)
    }

    pub fn fail_queries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn scoped(&self, owner: Uuid, scope: &Scope) -> Vec<StoredImage> {
        let images = self.images.lock().unwrap();
        images
            .iter()
            .filter(|s| s.image.user_id == owner)
            .filter(|s| match scope {
                Scope::Empty => false,
                Scope::Filtered(predicates) => matches(s, predicates),
                Scope::Keys(ids) => ids.contains(&s.image.id),
            })
            .cloned()
            .collect()
    }
}

fn matches(stored: &StoredImage, predicates: &Predicates) -> bool {
    let image = &stored.image;
    let taken_ok = predicates.taken.is_empty()
        || stored
            .taken_at
            .is_some_and(|taken| predicates.taken.contains(&taken));

    predicates
        .keyword
        .as_deref()
        .is_none_or(|k| image.original_filename.contains(k))
        && predicates.created.contains(&image.created_at)
        && taken_ok
        && predicates.width.contains(&image.width)
        && predicates.height.contains(&image.height)
        && predicates.size_bytes.contains(&image.file_size)
}

impl ImageStore for MemoryStore {
    async fn resolve_tags(&self, owner: Uuid, names: &[String]) -> Result<Vec<Tag>, AppError> {
        self.check()?;
        let tags = self.tags.lock().unwrap();
        Ok(tags
            .iter()
            .filter(|t| t.user_id == owner && names.contains(&t.name))
            .cloned()
            .collect())
    }

    async fn matching_ids(&self, owner: Uuid, query: &KeyQuery) -> Result<Vec<Uuid>, AppError> {
        self.key_queries.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let images = self.images.lock().unwrap();
        Ok(images
            .iter()
            .filter(|s| s.image.user_id == owner && matches(s, &query.predicates))
            .filter(|s| match &query.tags {
                None => true,
                Some(tags) => match tags.mode {
                    Mode::Or => tags.names.iter().any(|n| s.tag_names.contains(n)),
                    Mode::And => tags.names.iter().all(|n| s.tag_names.contains(n)),
                },
            })
            .map(|s| s.image.id)
            .collect())
    }

    async fn count(&self, owner: Uuid, scope: &Scope) -> Result<i64, AppError> {
        self.check()?;
        Ok(self.scoped(owner, scope).len() as i64)
    }

    async fn fetch_page(
        &self,
        owner: Uuid,
        scope: &Scope,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Image>, AppError> {
        self.check()?;
        let mut rows: Vec<Image> = self
            .scoped(owner, scope)
            .into_iter()
            .map(|s| s.image)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn attach(&self, images: Vec<Image>) -> Result<Vec<ImageWithAssociations>, AppError> {
        self.check()?;
        let stored = self.images.lock().unwrap();
        let catalog = self.tags.lock().unwrap();
        Ok(images
            .into_iter()
            .map(|image| {
                let entry = stored.iter().find(|s| s.image.id == image.id);
                let mut tags: Vec<Tag> = entry
                    .map(|s| {
                        catalog
                            .iter()
                            .filter(|t| t.user_id == image.user_id && s.tag_names.contains(&t.name))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                tags.sort_by(|a, b| a.name.cmp(&b.name));
                let exif = entry.filter(|s| s.has_exif).map(|s| ImageExif {
                    image_id: image.id,
                    camera_make: None,
                    camera_model: None,
                    taken_at: s.taken_at,
                });
                let thumbnail = Some(Thumbnail {
                    image_id: image.id,
                    storage_key: format!("thumbnails/{}.webp", image.id),
                    width: 300,
                    height: 300,
                    size: 100,
                });
                ImageWithAssociations {
                    image,
                    tags,
                    exif,
                    thumbnail,
                }
            })
            .collect())
    }
}
