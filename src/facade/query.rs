//! Options and results of paginated reads.

use crate::core::{Document, ID_FIELD};
use crate::storage::SortOrder;
use serde::{Deserialize, Serialize};

pub const FIRST_PAGE: u64 = 0;
pub const ENTRIES_PER_PAGE: u64 = 10;

/// Options for [`Database::find_many`](super::Database::find_many).
///
/// Deserializes from the same shape callers pass around as JSON:
///
/// ```
/// use covulor::FindOptions;
///
/// let options: FindOptions = serde_json::from_value(serde_json::json!({
///     "filters": {"status": "open"},
///     "sort": {"field": "date", "order": -1},
///     "pagination": {"page": 2, "page_size": 25}
/// })).unwrap();
///
/// assert_eq!(options.pagination.page_size, 25);
/// assert!(options.pagination.paginate);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    /// Extra constraints ANDed with the tenant filter
    pub filters: Document,
    /// Fields to return; `None` returns whole documents
    pub fields: Option<Vec<String>>,
    pub sort: Sort,
    pub pagination: Pagination,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.filters.insert(field.to_string(), value.into());
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Sort {
            field: field.to_string(),
            order,
        };
        self
    }

    pub fn page(mut self, page: u64, page_size: u64) -> Self {
        self.pagination = Pagination {
            paginate: true,
            page,
            page_size,
        };
        self
    }

    /// Return every match in one response
    pub fn all(mut self) -> Self {
        self.pagination.paginate = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: ID_FIELD.to_string(),
            order: SortOrder::Ascending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub paginate: bool,
    /// Zero-based page index
    pub page: u64,
    /// Records per page; zero falls back to the default
    pub page_size: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            paginate: true,
            page: FIRST_PAGE,
            page_size: ENTRIES_PER_PAGE,
        }
    }
}

impl Pagination {
    pub fn effective_page_size(&self) -> u64 {
        if self.page_size == 0 {
            ENTRIES_PER_PAGE
        } else {
            self.page_size
        }
    }

    pub fn skip(&self) -> u64 {
        self.page.saturating_mul(self.effective_page_size())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    /// One-based page number
    pub page: u64,
    pub page_count: u64,
    pub page_size: u64,
    pub total: u64,
}

impl PaginationMeta {
    /// `page` is the zero-based page that was requested.
    pub fn new(page: u64, page_size: u64, total: u64) -> Self {
        Self {
            page: page.saturating_add(1),
            page_count: total.div_ceil(page_size),
            page_size,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub pagination: PaginationMeta,
}

/// One page of results, serialized as `{"data": [...], "meta": {"pagination": {...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T = Document> {
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PageMeta>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            meta: None,
        }
    }

    pub fn pagination(&self) -> Option<&PaginationMeta> {
        self.meta.as_ref().map(|m| &m.pagination)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Convert every record, keeping the metadata; stops at the first failure.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            data: self.data.into_iter().map(f).collect::<Result<Vec<_>, E>>()?,
            meta: self.meta,
        })
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Result of an update that distinguishes the no-op cases.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// No record matched the id and tenant
    NotFound,
    /// A record matched but every field already had the given value
    Unchanged(Document),
    /// At least one field changed; holds the record after the update
    Updated(Document),
}

impl UpdateOutcome {
    /// Collapse to the compatible form: only a real change yields a document
    pub fn into_updated(self) -> Option<Document> {
        match self {
            UpdateOutcome::Updated(document) => Some(document),
            _ => None,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = FindOptions::default();

        assert!(options.filters.is_empty());
        assert_eq!(options.fields, None);
        assert_eq!(options.sort.field, "_id");
        assert_eq!(options.sort.order, SortOrder::Ascending);
        assert!(options.pagination.paginate);
        assert_eq!(options.pagination.page, 0);
        assert_eq!(options.pagination.page_size, 10);
    }

    #[test]
    fn test_partial_options_deserialize() {
        let options: FindOptions = serde_json::from_value(json!({
            "sort": {"order": -1},
            "pagination": {"paginate": false}
        }))
        .unwrap();

        assert_eq!(options.sort.field, "_id");
        assert_eq!(options.sort.order, SortOrder::Descending);
        assert!(!options.pagination.paginate);
        assert_eq!(options.pagination.page_size, 10);
    }

    #[test]
    fn test_zero_page_size_uses_default() {
        let pagination = Pagination {
            paginate: true,
            page: 3,
            page_size: 0,
        };

        assert_eq!(pagination.effective_page_size(), 10);
        assert_eq!(pagination.skip(), 30);
    }

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(2, 10, 23);
        assert_eq!(meta.page, 3);
        assert_eq!(meta.page_count, 3);

        let meta = PaginationMeta::new(u64::MAX, 1, 5);
        assert_eq!(meta.page, u64::MAX);
        assert_eq!(meta.page_count, 5);

        let meta = PaginationMeta::new(0, 10, 0);
        assert_eq!(meta.page, 1);
        assert_eq!(meta.page_count, 0);
    }

    #[test]
    fn test_page_serialization() {
        let page: Page = Page {
            data: vec![],
            meta: Some(PageMeta {
                pagination: PaginationMeta::new(0, 10, 4),
            }),
        };

        assert_eq!(
            serde_json::to_value(&page).unwrap(),
            json!({
                "data": [],
                "meta": {"pagination": {"page": 1, "pageCount": 1, "pageSize": 10, "total": 4}}
            })
        );

        let unpaged: Page = Page::empty();
        assert_eq!(serde_json::to_value(&unpaged).unwrap(), json!({"data": []}));
    }

    #[test]
    fn test_update_outcome_compat() {
        let doc = Document::new();

        assert_eq!(UpdateOutcome::NotFound.into_updated(), None);
        assert_eq!(UpdateOutcome::Unchanged(doc.clone()).into_updated(), None);
        assert_eq!(UpdateOutcome::Updated(doc.clone()).into_updated(), Some(doc));
    }
}
