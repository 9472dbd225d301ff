//! Filter normalization: raw query-string values in, typed predicates out.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

use super::store::ImageStore;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const FULL_WIDTH_COMMA: char = '，';

/// Raw filter input as it arrives from the query string. Every value is a
/// string; empty strings mean "no constraint". Unknown keys are ignored.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchParams {
    pub keyword: Option<String>,
    pub keyword_mode: Option<String>,
    #[serde(alias = "start_date")]
    pub created_start: Option<String>,
    #[serde(alias = "end_date")]
    pub created_end: Option<String>,
    pub taken_start: Option<String>,
    pub taken_end: Option<String>,
    pub width_min: Option<String>,
    pub width_max: Option<String>,
    pub height_min: Option<String>,
    pub height_max: Option<String>,
    /// Megabytes, fractional values allowed.
    pub size_min: Option<String>,
    pub size_max: Option<String>,
    pub tags: Option<String>,
    pub tag_mode: Option<String>,
}

/// Boolean combination mode. Anything other than exactly `"and"` widens to `Or`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    And,
    #[default]
    Or,
}

impl Mode {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("and") => Self::And,
            Some("or") => Self::Or,
            _ => Self::Or,
        }
    }
}

/// An optional lower and upper bound, both inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: PartialOrd> Range<T> {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.min.as_ref().is_none_or(|min| value >= min)
            && self.max.as_ref().is_none_or(|max| value <= max)
    }
}

/// The typed, per-request filter set. Unset fields never mean "match nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilterSet {
    pub keyword: Option<String>,
    pub keyword_mode: Mode,
    pub created: Range<DateTime<Utc>>,
    pub taken: Range<DateTime<Utc>>,
    pub width: Range<i32>,
    pub height: Range<i32>,
    pub size_bytes: Range<i64>,
    pub tag_names: Vec<String>,
    pub tag_mode: Mode,
}

impl SearchFilterSet {
    pub fn from_params(params: &SearchParams) -> Result<Self, AppError> {
        Ok(Self {
            // Blank means absent; otherwise the raw text is the substring to match.
            keyword: params
                .keyword
                .clone()
                .filter(|k| !k.trim().is_empty()),
            keyword_mode: Mode::parse(params.keyword_mode.as_deref()),
            created: Range {
                min: parse_bound(&params.created_start, "created_start", Bound::Start)?,
                max: parse_bound(&params.created_end, "created_end", Bound::End)?,
            },
            taken: Range {
                min: parse_bound(&params.taken_start, "taken_start", Bound::Start)?,
                max: parse_bound(&params.taken_end, "taken_end", Bound::End)?,
            },
            width: Range {
                min: parse_int(&params.width_min, "width_min")?,
                max: parse_int(&params.width_max, "width_max")?,
            },
            height: Range {
                min: parse_int(&params.height_min, "height_min")?,
                max: parse_int(&params.height_max, "height_max")?,
            },
            size_bytes: Range {
                min: parse_megabytes(&params.size_min, "size_min")?.map(min_bytes),
                max: parse_megabytes(&params.size_max, "size_max")?.map(max_bytes),
            },
            tag_names: params
                .tags
                .as_deref()
                .map(parse_tag_string)
                .unwrap_or_default(),
            tag_mode: Mode::parse(params.tag_mode.as_deref()),
        })
    }

    pub fn has_keyword(&self) -> bool {
        self.keyword.is_some()
    }

    /// True iff any non-keyword dimension is constrained.
    pub fn has_other_filters(&self) -> bool {
        !self.created.is_empty()
            || !self.taken.is_empty()
            || !self.width.is_empty()
            || !self.height.is_empty()
            || !self.size_bytes.is_empty()
            || !self.tag_names.is_empty()
    }
}

/// Tag names that survived catalog resolution, with their combination mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    pub names: Vec<String>,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    None,
    /// Tag names were given but none exist for this user: the whole search is empty.
    Unsatisfiable,
    Match(TagMatch),
}

/// Resolve requested tag names against the owner's catalog, dropping unknown names.
pub async fn resolve_tags<S: ImageStore>(
    store: &S,
    owner: Uuid,
    filters: &SearchFilterSet,
) -> Result<TagFilter, AppError> {
    if filters.tag_names.is_empty() {
        return Ok(TagFilter::None);
    }

    let existing = store.resolve_tags(owner, &filters.tag_names).await?;
    let names: Vec<String> = existing
        .into_iter()
        .map(|t| t.name)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    tracing::debug!(requested = ?filters.tag_names, resolved = ?names, "resolved tag filter");

    if names.is_empty() {
        return Ok(TagFilter::Unsatisfiable);
    }
    Ok(TagFilter::Match(TagMatch {
        names,
        mode: filters.tag_mode,
    }))
}

/// Split a tag list on ASCII or full-width commas. Entries are trimmed,
/// empties dropped and duplicates collapsed; the result is sorted.
pub fn parse_tag_string(raw: &str) -> Vec<String> {
    raw.replace(FULL_WIDTH_COMMA, ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Byte threshold for a minimum size: the smallest whole byte count >= `mb` megabytes.
pub fn min_bytes(mb: f64) -> i64 {
    let exact = mb * BYTES_PER_MB;
    snap(exact).unwrap_or_else(|| exact.ceil() as i64)
}

/// Byte threshold for a maximum size: the largest whole byte count <= `mb` megabytes.
pub fn max_bytes(mb: f64) -> i64 {
    let exact = mb * BYTES_PER_MB;
    snap(exact).unwrap_or_else(|| exact.floor() as i64)
}

/// Absorb floating-point drift around whole byte counts.
fn snap(bytes: f64) -> Option<i64> {
    let nearest = bytes.round();
    ((bytes - nearest).abs() < 1e-6).then_some(nearest as i64)
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// A bound that does not parse is an error, never a silently dropped filter.
fn parse_int(value: &Option<String>, field: &str) -> Result<Option<i32>, AppError> {
    present(value)
        .map(|s| {
            s.parse::<i32>()
                .map_err(|_| AppError::BadRequest(format!("{field} must be an integer")))
        })
        .transpose()
}

/// Non-positive sizes impose no constraint.
fn parse_megabytes(value: &Option<String>, field: &str) -> Result<Option<f64>, AppError> {
    let Some(s) = present(value) else {
        return Ok(None);
    };
    let mb: f64 = s
        .parse()
        .ok()
        .filter(|mb: &f64| mb.is_finite())
        .ok_or_else(|| AppError::BadRequest(format!("{field} must be a number of megabytes")))?;
    Ok((mb > 0.0).then_some(mb))
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Start,
    End,
}

fn parse_bound(
    value: &Option<String>,
    field: &str,
    bound: Bound,
) -> Result<Option<DateTime<Utc>>, AppError> {
    present(value)
        .map(|s| {
            parse_timestamp(s, bound)
                .ok_or_else(|| AppError::BadRequest(format!("{field} is not a valid date")))
        })
        .transpose()
}

/// Accepts RFC 3339, naive date-times (read as UTC) and bare dates. A bare
/// date used as an end bound covers the whole day.
fn parse_timestamp(s: &str, bound: Bound) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let time = match bound {
        Bound::Start => NaiveTime::MIN,
        Bound::End => NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)?,
    };
    Some(date.and_time(time).and_utc())
}
