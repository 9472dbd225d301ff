//! Image search: filter normalization, predicate composition and result
//! materialization over an [`ImageStore`].

pub mod compose;
pub mod filter;
pub mod materialize;
pub mod store;

#[cfg(test)]
mod memory;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::image::ImageWithAssociations;

pub use filter::SearchParams;
pub use materialize::{Paging, SearchPage};
pub use store::{ImageStore, PgImageStore};

use compose::Scope;
use filter::SearchFilterSet;

/// Search one owner's library. Storage errors abort the whole search.
#[tracing::instrument(skip(store, params))]
pub async fn search<S: ImageStore>(
    store: &S,
    owner: Uuid,
    params: &SearchParams,
    paging: Paging,
) -> Result<SearchPage, AppError> {
    let filters = SearchFilterSet::from_params(params)?;
    let tags = filter::resolve_tags(store, owner, &filters).await?;
    let scope = compose::compose(store, owner, &filters, tags).await?;
    tracing::debug!(?scope, "composed search scope");
    materialize::materialize(store, owner, &scope, paging).await
}

/// Fetch a single owned image with its children.
pub async fn find_image<S: ImageStore>(
    store: &S,
    owner: Uuid,
    id: Uuid,
) -> Result<Option<ImageWithAssociations>, AppError> {
    Ok(find_images(store, owner, vec![id]).await?.into_iter().next())
}

/// Fetch the owned images among `ids`, newest first. Foreign or unknown ids are skipped.
pub async fn find_images<S: ImageStore>(
    store: &S,
    owner: Uuid,
    ids: Vec<Uuid>,
) -> Result<Vec<ImageWithAssociations>, AppError> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let limit = ids.len() as i64;
    let rows = store.fetch_page(owner, &Scope::Keys(ids), limit, 0).await?;
    store.attach(rows).await
}

/// Every image in the owner's library, newest first.
pub async fn library<S: ImageStore>(
    store: &S,
    owner: Uuid,
) -> Result<Vec<ImageWithAssociations>, AppError> {
    let scope = Scope::Filtered(compose::Predicates::default());
    let rows = store.fetch_page(owner, &scope, i64::MAX, 0).await?;
    store.attach(rows).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{TimeZone, Utc};

    use super::memory::{MemoryStore, StoredImage};
    use super::*;

    const MB: i64 = 1024 * 1024;

    fn names(page: &SearchPage) -> Vec<&str> {
        page.items
            .iter()
            .map(|i| i.image.original_filename.as_str())
            .collect()
    }

    fn sorted(mut v: Vec<&str>) -> Vec<&str> {
        v.sort();
        v
    }

    async fn run(store: &MemoryStore, owner: Uuid, params: SearchParams) -> SearchPage {
        search(store, owner, &params, Paging::new(1, 20)).await.unwrap()
    }

    #[tokio::test]
    async fn no_constraints_returns_everything_newest_first() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "old.jpg").created_minutes_ago(30));
        store.insert(StoredImage::new(owner, "new.jpg").created_minutes_ago(1));
        store.insert(StoredImage::new(owner, "mid.jpg").created_minutes_ago(10));
        store.insert(StoredImage::new(Uuid::new_v4(), "someone-else.jpg"));

        let page = run(&store, owner, SearchParams::default()).await;
        assert_eq!(page.total, 3);
        assert_eq!(names(&page), vec!["new.jpg", "mid.jpg", "old.jpg"]);
    }

    #[tokio::test]
    async fn keyword_only_matches_filename_substring() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "cat.jpg"));
        store.insert(StoredImage::new(owner, "dog.jpg"));

        let page = run(
            &store,
            owner,
            SearchParams {
                keyword: Some("cat".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(page.total, 1);
        assert_eq!(names(&page), vec!["cat.jpg"]);
    }

    #[tokio::test]
    async fn keyword_whitespace_is_part_of_the_substring() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "cat.jpg").created_minutes_ago(5));
        store.insert(StoredImage::new(owner, "black cat.jpg"));

        let page = run(
            &store,
            owner,
            SearchParams {
                keyword: Some(" cat".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(page.total, 1);
        assert_eq!(names(&page), vec!["black cat.jpg"]);
    }

    #[tokio::test]
    async fn tag_and_requires_all_tag_or_requires_any() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "a.jpg").tagged(&["A"]));
        store.insert(StoredImage::new(owner, "b.jpg").tagged(&["B"]));
        store.insert(StoredImage::new(owner, "ab.jpg").tagged(&["A", "B"]));
        store.insert(StoredImage::new(owner, "none.jpg"));

        let and = run(
            &store,
            owner,
            SearchParams {
                tags: Some("A,B".into()),
                tag_mode: Some("and".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(names(&and), vec!["ab.jpg"]);
        assert_eq!(and.total, 1);

        let or = run(
            &store,
            owner,
            SearchParams {
                tags: Some("A，B".into()),
                tag_mode: Some("or".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(sorted(names(&or)), vec!["a.jpg", "ab.jpg", "b.jpg"]);
        assert_eq!(or.total, 3);
    }

    #[tokio::test]
    async fn unknown_tag_names_are_dropped_when_others_resolve() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "a.jpg").tagged(&["A"]));
        store.insert(StoredImage::new(owner, "b.jpg"));

        let page = run(
            &store,
            owner,
            SearchParams {
                tags: Some("A,ghost".into()),
                tag_mode: Some("and".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(names(&page), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn unsatisfiable_tags_return_nothing_regardless_of_other_filters() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "cat.jpg").tagged(&["pets"]));
        store.insert(StoredImage::new(owner, "dog.jpg"));

        for keyword_mode in ["and", "or"] {
            let page = run(
                &store,
                owner,
                SearchParams {
                    keyword: Some("cat".into()),
                    keyword_mode: Some(keyword_mode.into()),
                    tags: Some("nonexistent".into()),
                    ..SearchParams::default()
                },
            )
            .await;
            assert_eq!(page, SearchPage::empty(), "keyword_mode={keyword_mode}");
        }
        assert_eq!(store.key_queries(), 0);
    }

    #[tokio::test]
    async fn tags_of_other_owners_do_not_resolve() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "mine.jpg"));
        store.insert(StoredImage::new(other, "theirs.jpg").tagged(&["shared"]));

        let page = run(
            &store,
            owner,
            SearchParams {
                tags: Some("shared".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(page, SearchPage::empty());
    }

    #[tokio::test]
    async fn keyword_mode_switches_between_intersection_and_union() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        let jan = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let jun = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        store.insert(StoredImage::new(owner, "beach-x.jpg").created(jan));
        store.insert(StoredImage::new(owner, "y.jpg").created(jun));
        store.insert(StoredImage::new(owner, "z.jpg").created(jan));

        let params = |mode: &str| SearchParams {
            keyword: Some("beach".into()),
            keyword_mode: Some(mode.into()),
            created_start: Some("2024-06-01".into()),
            created_end: Some("2024-06-30".into()),
            ..SearchParams::default()
        };

        let and = run(&store, owner, params("and")).await;
        assert_eq!(and, SearchPage::empty());

        let or = run(&store, owner, params("or")).await;
        assert_eq!(sorted(names(&or)), vec!["beach-x.jpg", "y.jpg"]);
        assert_eq!(or.total, 2);

        // Anything but "and"/"or" widens to OR.
        let fallback = run(&store, owner, params("both")).await;
        assert_eq!(fallback.total, 2);
    }

    #[tokio::test]
    async fn keyword_and_with_tags_uses_the_key_phase() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "trip-rome.jpg").tagged(&["travel"]));
        store.insert(StoredImage::new(owner, "trip-home.jpg"));
        store.insert(StoredImage::new(owner, "rome.jpg").tagged(&["travel"]));

        let page = run(
            &store,
            owner,
            SearchParams {
                keyword: Some("trip".into()),
                keyword_mode: Some("and".into()),
                tags: Some("travel".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(names(&page), vec!["trip-rome.jpg"]);
        assert_eq!(page.items[0].tags.len(), 1);
        assert_eq!(store.key_queries(), 1);
    }

    #[tokio::test]
    async fn pages_partition_the_result_set() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        for i in 0..23 {
            // Pairs of images share a timestamp so ordering relies on the id tiebreak.
            let tags: &[&str] = if i % 3 == 0 { &["odd"] } else { &[] };
            store.insert(
                StoredImage::new(owner, &format!("img-{i:02}.jpg"))
                    .created_minutes_ago(i / 2)
                    .tagged(tags),
            );
        }

        for params in [
            SearchParams::default(),
            SearchParams {
                tags: Some("odd".into()),
                ..SearchParams::default()
            },
            SearchParams {
                keyword: Some("img-1".into()),
                keyword_mode: Some("or".into()),
                tags: Some("odd".into()),
                ..SearchParams::default()
            },
        ] {
            let first = search(&store, owner, &params, Paging::new(1, 5)).await.unwrap();
            let total = first.total;
            let mut seen = HashSet::new();
            let mut count = 0;
            let mut page = 1;
            loop {
                let result = search(&store, owner, &params, Paging::new(page, 5)).await.unwrap();
                assert_eq!(result.total, total);
                if result.items.is_empty() {
                    break;
                }
                for item in &result.items {
                    assert!(seen.insert(item.image.id), "image repeated across pages");
                }
                count += result.items.len() as i64;
                page += 1;
            }
            assert_eq!(count, total);
        }
    }

    #[tokio::test]
    async fn repeated_searches_are_identical() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        for i in 0..8 {
            store.insert(StoredImage::new(owner, &format!("same-{i}.jpg")).tagged(&["t"]));
        }
        let params = SearchParams {
            keyword: Some("same".into()),
            tags: Some("t".into()),
            ..SearchParams::default()
        };

        let first = search(&store, owner, &params, Paging::new(1, 3)).await.unwrap();
        let second = search(&store, owner, &params, Paging::new(1, 3)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total, 8);
    }

    #[tokio::test]
    async fn size_floor_is_exact_at_the_megabyte_boundary() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "exact.jpg").size(1_572_864));

        let at = |mb: &str| SearchParams {
            size_min: Some(mb.into()),
            ..SearchParams::default()
        };
        assert_eq!(run(&store, owner, at("1.5")).await.total, 1);
        assert_eq!(run(&store, owner, at("1.6")).await.total, 0);

        let ceiling = |mb: &str| SearchParams {
            size_max: Some(mb.into()),
            ..SearchParams::default()
        };
        assert_eq!(run(&store, owner, ceiling("1.5")).await.total, 1);
        assert_eq!(run(&store, owner, ceiling("1.4")).await.total, 0);
    }

    #[tokio::test]
    async fn tagged_trips_above_size_floor() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "trip1.jpg").tagged(&["travel"]).size(2 * MB));
        store.insert(
            StoredImage::new(owner, "trip2.jpg")
                .tagged(&["travel", "family"])
                .size(5 * MB),
        );
        store.insert(StoredImage::new(owner, "work.jpg").size(MB));

        let page = run(
            &store,
            owner,
            SearchParams {
                tags: Some("travel,family".into()),
                tag_mode: Some("or".into()),
                size_min: Some("1.5".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(page.total, 2);
        assert_eq!(sorted(names(&page)), vec!["trip1.jpg", "trip2.jpg"]);
    }

    #[tokio::test]
    async fn taken_range_excludes_images_without_exif() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        let shot = Utc.with_ymd_and_hms(2023, 8, 10, 9, 0, 0).unwrap();
        store.insert(StoredImage::new(owner, "with-exif.jpg").taken(Some(shot)));
        store.insert(StoredImage::new(owner, "exif-no-date.jpg").taken(None));
        store.insert(StoredImage::new(owner, "no-exif.jpg"));

        let page = run(
            &store,
            owner,
            SearchParams {
                taken_start: Some("2023-08-01".into()),
                taken_end: Some("2023-08-31".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(names(&page), vec!["with-exif.jpg"]);
        assert_eq!(page.items[0].exif.as_ref().unwrap().taken_at, Some(shot));
    }

    #[tokio::test]
    async fn dimension_ranges_are_inclusive() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "small.jpg").dimensions(640, 480));
        store.insert(StoredImage::new(owner, "hd.jpg").dimensions(1920, 1080));
        store.insert(StoredImage::new(owner, "4k.jpg").dimensions(3840, 2160));

        let page = run(
            &store,
            owner,
            SearchParams {
                width_min: Some("1920".into()),
                height_max: Some("1080".into()),
                ..SearchParams::default()
            },
        )
        .await;
        assert_eq!(names(&page), vec!["hd.jpg"]);
    }

    #[tokio::test]
    async fn results_carry_their_associations() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "tagged.jpg").tagged(&["b", "a"]));

        let page = run(
            &store,
            owner,
            SearchParams {
                tags: Some("a".into()),
                ..SearchParams::default()
            },
        )
        .await;
        let item = &page.items[0];
        let tag_names: Vec<&str> = item.tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tag_names, vec!["a", "b"]);
        assert!(item.thumbnail.is_some());
    }

    #[tokio::test]
    async fn storage_failures_abort_the_search() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        store.insert(StoredImage::new(owner, "a.jpg"));
        store.fail_queries();

        let err = search(&store, owner, &SearchParams::default(), Paging::new(1, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }

    #[tokio::test]
    async fn malformed_filters_are_rejected_before_any_query() {
        let store = MemoryStore::default();
        store.fail_queries();
        let err = search(
            &store,
            Uuid::new_v4(),
            &SearchParams {
                height_min: Some("tall".into()),
                ..SearchParams::default()
            },
            Paging::new(1, 20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn find_image_is_owner_scoped() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        let id = store.insert(StoredImage::new(owner, "mine.jpg").tagged(&["x"]));

        let found = find_image(&store, owner, id).await.unwrap().unwrap();
        assert_eq!(found.image.id, id);
        assert_eq!(found.tags.len(), 1);
        assert!(find_image(&store, Uuid::new_v4(), id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_images_skips_foreign_ids() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        let older = store.insert(StoredImage::new(owner, "older.jpg").created_minutes_ago(10));
        let newer = store.insert(StoredImage::new(owner, "newer.jpg"));
        let foreign = store.insert(StoredImage::new(Uuid::new_v4(), "theirs.jpg"));

        let found = find_images(&store, owner, vec![older, foreign, newer])
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|i| i.image.id).collect();
        assert_eq!(ids, vec![newer, older]);

        assert!(find_images(&store, owner, vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn library_lists_only_the_owner() {
        let owner = Uuid::new_v4();
        let store = MemoryStore::default();
        for i in 0..3 {
            store.insert(StoredImage::new(owner, &format!("{i}.jpg")));
        }
        store.insert(StoredImage::new(Uuid::new_v4(), "other.jpg"));

        let images = library(&store, owner).await.unwrap();
        assert_eq!(images.len(), 3);
        assert!(images.iter().all(|i| i.image.user_id == owner));
    }
}
