use std::collections::HashMap;
use std::future::Future;

use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::image::{Image, ImageExif, ImageWithAssociations, Thumbnail};
use crate::models::tag::Tag;

use super::compose::{KeyQuery, Predicates, Scope};
use super::filter::Mode;

/// The storage collaborator the search engine runs on. Every method is a
/// single read; implementations must scope everything to `owner`.
pub trait ImageStore: Send + Sync {
    /// Existing tags of `owner` whose name is in `names`.
    fn resolve_tags(
        &self,
        owner: Uuid,
        names: &[String],
    ) -> impl Future<Output = Result<Vec<Tag>, AppError>> + Send;

    /// Ids of the owner's images matching a key-set query, each at most once.
    fn matching_ids(
        &self,
        owner: Uuid,
        query: &KeyQuery,
    ) -> impl Future<Output = Result<Vec<Uuid>, AppError>> + Send;

    fn count(&self, owner: Uuid, scope: &Scope) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// One page of the scope, newest first.
    fn fetch_page(
        &self,
        owner: Uuid,
        scope: &Scope,
        limit: i64,
        offset: i64,
    ) -> impl Future<Output = Result<Vec<Image>, AppError>> + Send;

    /// Eager-load tags, EXIF and thumbnail for each row, preserving order.
    fn attach(
        &self,
        images: Vec<Image>,
    ) -> impl Future<Output = Result<Vec<ImageWithAssociations>, AppError>> + Send;
}

#[derive(Clone)]
pub struct PgImageStore {
    db: PgPool,
}

impl PgImageStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(FromRow)]
struct ImageTagRow {
    image_id: Uuid,
    #[sqlx(flatten)]
    tag: Tag,
}

impl ImageStore for PgImageStore {
    async fn resolve_tags(&self, owner: Uuid, names: &[String]) -> Result<Vec<Tag>, AppError> {
        let tags = sqlx::query_as::<_, Tag>(
            "SELECT id, user_id, name, color, created_at FROM tags
             WHERE user_id = $1 AND name = ANY($2)",
        )
        .bind(owner)
        .bind(names.to_vec())
        .fetch_all(&self.db)
        .await?;
        Ok(tags)
    }

    async fn matching_ids(&self, owner: Uuid, query: &KeyQuery) -> Result<Vec<Uuid>, AppError> {
        let ids = key_query(owner, query)
            .build_query_scalar::<Uuid>()
            .fetch_all(&self.db)
            .await?;
        Ok(ids)
    }

    async fn count(&self, owner: Uuid, scope: &Scope) -> Result<i64, AppError> {
        let total = scoped_query("SELECT COUNT(*) FROM images i", owner, scope)
            .build_query_scalar::<i64>()
            .fetch_one(&self.db)
            .await?;
        Ok(total)
    }

    async fn fetch_page(
        &self,
        owner: Uuid,
        scope: &Scope,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Image>, AppError> {
        let rows = page_query(owner, scope, limit, offset)
            .build_query_as::<Image>()
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn attach(&self, images: Vec<Image>) -> Result<Vec<ImageWithAssociations>, AppError> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<Uuid> = images.iter().map(|i| i.id).collect();

        let tag_rows = sqlx::query_as::<_, ImageTagRow>(
            "SELECT it.image_id, t.id, t.user_id, t.name, t.color, t.created_at
             FROM image_tags it
             JOIN tags t ON t.id = it.tag_id
             WHERE it.image_id = ANY($1)
             ORDER BY t.name",
        )
        .bind(&ids)
        .fetch_all(&self.db)
        .await?;

        let exifs = sqlx::query_as::<_, ImageExif>(
            "SELECT image_id, camera_make, camera_model, taken_at
             FROM image_exifs WHERE image_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.db)
        .await?;

        let thumbnails = sqlx::query_as::<_, Thumbnail>(
            "SELECT image_id, storage_key, width, height, size
             FROM image_thumbnails WHERE image_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.db)
        .await?;

        let mut tags: HashMap<Uuid, Vec<Tag>> = HashMap::new();
        for row in tag_rows {
            tags.entry(row.image_id).or_default().push(row.tag);
        }
        let mut exifs: HashMap<Uuid, ImageExif> =
            exifs.into_iter().map(|e| (e.image_id, e)).collect();
        let mut thumbnails: HashMap<Uuid, Thumbnail> =
            thumbnails.into_iter().map(|t| (t.image_id, t)).collect();

        Ok(images
            .into_iter()
            .map(|image| ImageWithAssociations {
                tags: tags.remove(&image.id).unwrap_or_default(),
                exif: exifs.remove(&image.id),
                thumbnail: thumbnails.remove(&image.id),
                image,
            })
            .collect())
    }
}

/// Escape `LIKE` wildcards so user text matches literally.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn like_pattern(keyword: &str) -> String {
    format!("%{}%", escape_like(keyword))
}

fn push_exif_join(qb: &mut QueryBuilder<'static, Postgres>, predicates: &Predicates) {
    if !predicates.taken.is_empty() {
        qb.push(" LEFT JOIN image_exifs e ON e.image_id = i.id");
    }
}

fn push_where(qb: &mut QueryBuilder<'static, Postgres>, owner: Uuid, predicates: &Predicates) {
    qb.push(" WHERE i.user_id = ");
    qb.push_bind(owner);

    if let Some(keyword) = &predicates.keyword {
        qb.push(" AND i.original_filename LIKE ");
        qb.push_bind(like_pattern(keyword));
    }

    let bounds = [
        ("i.created_at", predicates.created.min, predicates.created.max),
        ("e.taken_at", predicates.taken.min, predicates.taken.max),
    ];
    for (column, min, max) in bounds {
        if let Some(min) = min {
            qb.push(format!(" AND {column} >= "));
            qb.push_bind(min);
        }
        if let Some(max) = max {
            qb.push(format!(" AND {column} <= "));
            qb.push_bind(max);
        }
    }

    for (column, range) in [("i.width", predicates.width), ("i.height", predicates.height)] {
        if let Some(min) = range.min {
            qb.push(format!(" AND {column} >= "));
            qb.push_bind(min);
        }
        if let Some(max) = range.max {
            qb.push(format!(" AND {column} <= "));
            qb.push_bind(max);
        }
    }

    if let Some(min) = predicates.size_bytes.min {
        qb.push(" AND i.file_size >= ");
        qb.push_bind(min);
    }
    if let Some(max) = predicates.size_bytes.max {
        qb.push(" AND i.file_size <= ");
        qb.push_bind(max);
    }
}

/// Tag OR joins the association once and filters with `ANY`; tag AND joins
/// one aliased association per name so every tag must be present.
fn key_query(owner: Uuid, query: &KeyQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT i.id FROM images i");
    push_exif_join(&mut qb, &query.predicates);

    if let Some(tags) = &query.tags {
        match tags.mode {
            Mode::Or => {
                qb.push(
                    " JOIN image_tags it ON it.image_id = i.id \
                     JOIN tags t ON t.id = it.tag_id AND t.user_id = ",
                );
                qb.push_bind(owner);
            }
            Mode::And => {
                for (n, name) in tags.names.iter().enumerate() {
                    qb.push(format!(
                        " JOIN image_tags it{n} ON it{n}.image_id = i.id \
                         JOIN tags t{n} ON t{n}.id = it{n}.tag_id AND t{n}.user_id = "
                    ));
                    qb.push_bind(owner);
                    qb.push(format!(" AND t{n}.name = "));
                    qb.push_bind(name.clone());
                }
            }
        }
    }

    push_where(&mut qb, owner, &query.predicates);

    if let Some(tags) = &query.tags {
        if tags.mode == Mode::Or {
            qb.push(" AND t.name = ANY(");
            qb.push_bind(tags.names.clone());
            qb.push(")");
        }
        qb.push(" GROUP BY i.id");
    }
    qb
}

/// A clean, join-free (EXIF aside) query over a scope.
fn scoped_query(select: &str, owner: Uuid, scope: &Scope) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(select);
    match scope {
        Scope::Filtered(predicates) => {
            push_exif_join(&mut qb, predicates);
            push_where(&mut qb, owner, predicates);
        }
        Scope::Keys(ids) => {
            push_where(&mut qb, owner, &Predicates::default());
            qb.push(" AND i.id = ANY(");
            qb.push_bind(ids.clone());
            qb.push(")");
        }
        Scope::Empty => {
            push_where(&mut qb, owner, &Predicates::default());
            qb.push(" AND FALSE");
        }
    }
    qb
}

fn page_query(owner: Uuid, scope: &Scope, limit: i64, offset: i64) -> QueryBuilder<'static, Postgres> {
    let mut qb = scoped_query("SELECT i.* FROM images i", owner, scope);
    qb.push(" ORDER BY i.created_at DESC, i.id DESC LIMIT ");
    qb.push_bind(limit);
    qb.push(" OFFSET ");
    qb.push_bind(offset);
    qb
}
