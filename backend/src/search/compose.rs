//! Predicate composition.
//!
//! Tag matching needs a join plus `GROUP BY`, which cannot be fed straight
//! into the final row fetch: grouped rows do not expand back into whole
//! images with their children. Whenever a tag predicate or a keyword OR is
//! involved, the composer resolves primary keys first and hands the
//! materializer a clean `id = ANY(..)` scope instead.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;

use super::filter::{Mode, Range, SearchFilterSet, TagFilter, TagMatch};
use super::store::ImageStore;

/// Join-free predicates over an owner's images. The taken-time range is the
/// one exception: it needs a left join to the optional EXIF row, which is
/// 1:1 and never multiplies rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicates {
    pub keyword: Option<String>,
    pub created: Range<DateTime<Utc>>,
    pub taken: Range<DateTime<Utc>>,
    pub width: Range<i32>,
    pub height: Range<i32>,
    pub size_bytes: Range<i64>,
}

impl Predicates {
    fn keyword_only(keyword: Option<String>) -> Self {
        Self {
            keyword,
            ..Self::default()
        }
    }

    fn others(filters: &SearchFilterSet) -> Self {
        Self {
            keyword: None,
            created: filters.created,
            taken: filters.taken,
            width: filters.width,
            height: filters.height,
            size_bytes: filters.size_bytes,
        }
    }

    fn with_keyword(self, keyword: Option<String>) -> Self {
        Self { keyword, ..self }
    }
}

/// A key-set query: returns only matching image ids, may join and group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyQuery {
    pub predicates: Predicates,
    pub tags: Option<TagMatch>,
}

/// What the materializer fetches. Neither variant ever carries a tag join.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Nothing can match; no further queries are issued.
    Empty,
    Filtered(Predicates),
    Keys(Vec<Uuid>),
}

pub async fn compose<S: ImageStore>(
    store: &S,
    owner: Uuid,
    filters: &SearchFilterSet,
    tags: TagFilter,
) -> Result<Scope, AppError> {
    let tags = match tags {
        TagFilter::Unsatisfiable => {
            tracing::debug!("no requested tag exists, short-circuiting");
            return Ok(Scope::Empty);
        }
        TagFilter::None => None,
        TagFilter::Match(m) => Some(m),
    };

    let keyword = filters.keyword.clone();
    let scope = match (filters.has_keyword(), filters.has_other_filters()) {
        (false, false) => Scope::Filtered(Predicates::default()),
        (true, false) => Scope::Filtered(Predicates::keyword_only(keyword)),
        (false, true) => {
            let predicates = Predicates::others(filters);
            narrow(store, owner, predicates, tags).await?
        }
        (true, true) => match filters.keyword_mode {
            Mode::And => {
                let predicates = Predicates::others(filters).with_keyword(keyword);
                narrow(store, owner, predicates, tags).await?
            }
            Mode::Or => {
                let by_keyword = KeyQuery {
                    predicates: Predicates::keyword_only(keyword),
                    tags: None,
                };
                let by_others = KeyQuery {
                    predicates: Predicates::others(filters),
                    tags,
                };
                let keyword_ids = store.matching_ids(owner, &by_keyword).await?;
                let other_ids = store.matching_ids(owner, &by_others).await?;
                tracing::debug!(
                    keyword = keyword_ids.len(),
                    others = other_ids.len(),
                    "union of keyword and filter key sets"
                );
                keys_scope(union(keyword_ids, other_ids))
            }
        },
    };

    Ok(scope)
}

/// Conjunctive filtering. Without tags the predicates go straight to the
/// final fetch; with tags they are first resolved to a key set.
async fn narrow<S: ImageStore>(
    store: &S,
    owner: Uuid,
    predicates: Predicates,
    tags: Option<TagMatch>,
) -> Result<Scope, AppError> {
    let Some(tags) = tags else {
        return Ok(Scope::Filtered(predicates));
    };

    let ids = store
        .matching_ids(
            owner,
            &KeyQuery {
                predicates,
                tags: Some(tags),
            },
        )
        .await?;
    tracing::debug!(matched = ids.len(), "tag key set resolved");
    Ok(keys_scope(ids))
}

fn keys_scope(ids: Vec<Uuid>) -> Scope {
    if ids.is_empty() {
        Scope::Empty
    } else {
        Scope::Keys(ids)
    }
}

fn union(a: Vec<Uuid>, b: Vec<Uuid>) -> Vec<Uuid> {
    a.into_iter()
        .chain(b)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
