use crate::error::ImageError;
use crate::model::{ImageRecord, ImageStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Window covered by the `recent` filter
pub const RECENT_WINDOW_HOURS: i64 = 24;

/// Field a listing is sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    CreatedAt,
    DisplayName,
}

impl SortKey {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("imageName") | Some("displayName") => SortKey::DisplayName,
            _ => SortKey::CreatedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("asc") => SortOrder::Ascending,
            _ => SortOrder::Descending,
        }
    }
}

/// Filters applied when listing one owner's records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageFilter {
    /// Case-insensitive substring of the display name
    pub search: Option<String>,
    /// Exact status
    pub status: Option<ImageStatus>,
    /// Only records created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
}

/// Query string accepted by the listing endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub status: Option<String>,
    pub sort_order: Option<String>,
    pub recent: Option<String>,
}

impl ImageFilter {
    /// Build a filter from raw query parameters, relative to `now`
    pub fn from_params(params: &ListParams, now: DateTime<Utc>) -> Result<Self, ImageError> {
        let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<ImageStatus>().map_err(ImageError::InvalidInput)?),
            None => None,
        };

        let recent = params.recent.as_deref() == Some("true");

        Ok(Self {
            search: params.search.clone().filter(|s| !s.is_empty()),
            status,
            created_after: recent.then(|| now - Duration::hours(RECENT_WINDOW_HOURS)),
            sort_key: SortKey::parse(params.sort_by.as_deref()),
            sort_order: SortOrder::parse(params.sort_order.as_deref()),
        })
    }

    /// Whether `record` passes every filter (ownership is checked separately)
    pub fn matches(&self, record: &ImageRecord) -> bool {
        if let Some(ref search) = self.search {
            if !record
                .display_name
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        true
    }

    /// Sort records by the requested key and order
    ///
    /// Names compare case-insensitively, ties broken by exact name then id.
    pub fn sort(&self, records: &mut [ImageRecord]) {
        records.sort_by(|a, b| {
            let ordering = match self.sort_key {
                SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                SortKey::DisplayName => a
                    .display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
                    .then_with(|| a.display_name.cmp(&b.display_name)),
            }
            .then_with(|| a.id.cmp(&b.id));

            match self.sort_order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }

    /// Apply filters and ordering to an unfiltered set of one owner's records
    pub fn apply(&self, records: impl IntoIterator<Item = ImageRecord>) -> Vec<ImageRecord> {
        let mut matched: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        self.sort(&mut matched);
        matched
    }
}

/// Escape `%`, `_` and `\` so a search term matches literally in SQL `LIKE`
pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerId;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn record(name: &str, status: ImageStatus, age_hours: i64) -> ImageRecord {
        let mut r = ImageRecord::pending(OwnerId(Uuid::nil()), name, PathBuf::from("x.jpg"));
        r.status = status;
        r.created_at = Utc::now() - Duration::hours(age_hours);
        r
    }

    fn names(records: &[ImageRecord]) -> Vec<&str> {
        records.iter().map(|r| r.display_name.as_str()).collect()
    }

    #[test]
    fn test_search_is_case_insensitive_substring() {
        let filter = ImageFilter {
            search: Some("cat".to_string()),
            ..Default::default()
        };
        let records = vec![
            record("Cat1", ImageStatus::Success, 3),
            record("cat2", ImageStatus::Success, 2),
            record("Dog1", ImageStatus::Success, 1),
        ];

        let matched = filter.apply(records);
        assert_eq!(names(&matched), ["cat2", "Cat1"]);
    }

    #[test]
    fn test_default_order_is_newest_first() {
        let filter = ImageFilter::from_params(&ListParams::default(), Utc::now()).unwrap();
        assert_eq!(filter.sort_key, SortKey::CreatedAt);
        assert_eq!(filter.sort_order, SortOrder::Descending);

        let matched = filter.apply(vec![
            record("old", ImageStatus::Success, 10),
            record("new", ImageStatus::Success, 1),
            record("mid", ImageStatus::Success, 5),
        ]);
        assert_eq!(names(&matched), ["new", "mid", "old"]);
    }

    #[test]
    fn test_sort_by_name_ascending() {
        let params = ListParams {
            sort_by: Some("imageName".to_string()),
            sort_order: Some("asc".to_string()),
            ..Default::default()
        };
        let filter = ImageFilter::from_params(&params, Utc::now()).unwrap();

        let matched = filter.apply(vec![
            record("b", ImageStatus::Success, 1),
            record("c", ImageStatus::Success, 2),
            record("a", ImageStatus::Success, 3),
        ]);
        assert_eq!(names(&matched), ["a", "b", "c"]);
    }

    #[test]
    fn test_name_sort_ignores_case() {
        let filter = ImageFilter {
            sort_key: SortKey::DisplayName,
            sort_order: SortOrder::Ascending,
            ..Default::default()
        };

        let matched = filter.apply(vec![
            record("cherry", ImageStatus::Success, 1),
            record("Banana", ImageStatus::Success, 2),
            record("apple", ImageStatus::Success, 3),
            record("banana", ImageStatus::Success, 4),
        ]);
        assert_eq!(names(&matched), ["apple", "Banana", "banana", "cherry"]);
    }

    #[test]
    fn test_status_and_recent_filters() {
        let params = ListParams {
            status: Some("fail".to_string()),
            recent: Some("true".to_string()),
            ..Default::default()
        };
        let filter = ImageFilter::from_params(&params, Utc::now()).unwrap();

        let matched = filter.apply(vec![
            record("recent-fail", ImageStatus::Fail, 2),
            record("old-fail", ImageStatus::Fail, 48),
            record("recent-ok", ImageStatus::Success, 2),
        ]);
        assert_eq!(names(&matched), ["recent-fail"]);
    }

    #[test]
    fn test_recent_only_when_true() {
        let params = ListParams {
            recent: Some("false".to_string()),
            ..Default::default()
        };
        let filter = ImageFilter::from_params(&params, Utc::now()).unwrap();
        assert!(filter.created_after.is_none());
    }

    #[test]
    fn test_unknown_status_is_invalid_input() {
        let params = ListParams {
            status: Some("done".to_string()),
            ..Default::default()
        };
        let err = ImageFilter::from_params(&params, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_empty_params_are_ignored() {
        let params = ListParams {
            search: Some(String::new()),
            status: Some(String::new()),
            ..Default::default()
        };
        let filter = ImageFilter::from_params(&params, Utc::now()).unwrap();
        assert!(filter.search.is_none());
        assert!(filter.status.is_none());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_cats\\"), "100\\%\\_cats\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
