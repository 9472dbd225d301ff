use uuid::Uuid;

use crate::error::AppError;
use crate::models::image::ImageWithAssociations;

use super::compose::Scope;
use super::store::ImageStore;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: i64,
    pub page_size: i64,
}

impl Paging {
    /// Pages start at 1; a non-positive size falls back to the default.
    pub fn new(page: i64, page_size: i64) -> Self {
        let page_size = if page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        Self {
            page: page.max(1),
            page_size,
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub items: Vec<ImageWithAssociations>,
    pub total: i64,
}

impl SearchPage {
    pub fn empty() -> Self {
        Self {
            items: vec![],
            total: 0,
        }
    }
}

/// Count the scope, fetch one page newest-first and attach children.
pub async fn materialize<S: ImageStore>(
    store: &S,
    owner: Uuid,
    scope: &Scope,
    paging: Paging,
) -> Result<SearchPage, AppError> {
    if matches!(scope, Scope::Empty) {
        return Ok(SearchPage::empty());
    }

    let total = store.count(owner, scope).await?;
    if total == 0 {
        return Ok(SearchPage::empty());
    }

    let rows = store
        .fetch_page(owner, scope, paging.page_size, paging.offset())
        .await?;
    let items = store.attach(rows).await?;

    Ok(SearchPage { items, total })
}
