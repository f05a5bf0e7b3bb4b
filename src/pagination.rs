//! Page/limit pagination shared by every list operation.

use serde::{Deserialize, Serialize};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// A page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, limit: usize) -> Self {
        Self { page, limit }
    }

    /// Clamps the request into the supported range.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Pagination cursor returned alongside every list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub pages: usize,
}

/// One page of items plus its cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    /// Cuts one page out of an already filtered and ordered list.
    pub fn slice(all: Vec<T>, request: PageRequest) -> Self {
        let request = request.normalized();
        let total = all.len();
        let pages = total.div_ceil(request.limit);
        let start = (request.page - 1).saturating_mul(request.limit);

        let items = all
            .into_iter()
            .skip(start)
            .take(request.limit)
            .collect();

        Self {
            items,
            pagination: Pagination {
                page: request.page,
                limit: request.limit,
                total,
                pages,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_pages() {
        let all: Vec<u32> = (1..=45).collect();

        let first = Page::slice(all.clone(), PageRequest::new(1, 20));
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.items[0], 1);
        assert_eq!(first.pagination.pages, 3);
        assert_eq!(first.pagination.total, 45);

        let last = Page::slice(all, PageRequest::new(3, 20));
        assert_eq!(last.items, vec![41, 42, 43, 44, 45]);
    }

    #[test]
    fn test_slice_past_end_is_empty() {
        let page = Page::slice(vec![1, 2, 3], PageRequest::new(5, 2));
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.pages, 2);
    }

    #[test]
    fn test_empty_list() {
        let page: Page<u8> = Page::slice(Vec::new(), PageRequest::default());
        assert_eq!(page.pagination.total, 0);
        assert_eq!(page.pagination.pages, 0);
    }

    #[test]
    fn test_normalized_limits() {
        let request = PageRequest::new(0, 1000).normalized();
        assert_eq!(request.page, 1);
        assert_eq!(request.limit, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(2, 0).normalized().limit, 1);
    }
}
