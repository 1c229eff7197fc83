//! Pagination over a session's persisted layer count
//!
//! Unlike a browsing view, out-of-range pages are rejected rather than
//! clamped: a page request either maps to real layers or fails.

use thiserror::Error;

/// Default number of layers per page
pub const DEFAULT_PAGE_SIZE: i64 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("Invalid page number. Must be between 1 and {total_pages}")]
    InvalidPage { page: i64, total_pages: i64 },

    #[error("Invalid page size. Must be between 1 and {max}")]
    InvalidPageSize { page_size: i64, max: i64 },
}

impl From<PaginationError> for eht_common::Error {
    fn from(err: PaginationError) -> Self {
        eht_common::Error::InvalidInput(err.to_string())
    }
}

/// Page boundaries over layer indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Current page number (1-indexed)
    pub page: i64,
    pub page_size: i64,
    /// Total number of pages
    pub total_pages: i64,
    /// First layer index on the page
    pub start_index: i64,
    /// One past the last layer index on the page
    pub end_index: i64,
}

/// Calculate page boundaries for a requested page
///
/// # Arguments
/// * `total_layers` - Persisted layer count of the session
/// * `page` - Requested page (1-indexed)
/// * `page_size` - Layers per page, at least 1
///
/// # Examples
/// ```
/// use eht_detect::pagination::calculate_pagination;
///
/// // 25 layers at 12 per page = 3 pages (12 + 12 + 1)
/// let p = calculate_pagination(25, 3, 12).unwrap();
/// assert_eq!(p.start_index, 24);
/// assert_eq!(p.end_index, 25);
/// assert_eq!(p.total_pages, 3);
///
/// // Pages past the end are rejected
/// assert!(calculate_pagination(25, 4, 12).is_err());
/// ```
pub fn calculate_pagination(
    total_layers: i64,
    page: i64,
    page_size: i64,
) -> Result<Pagination, PaginationError> {
    if page_size < 1 {
        return Err(PaginationError::InvalidPageSize {
            page_size,
            max: i64::MAX,
        });
    }

    let total_layers = total_layers.max(0);
    let total_pages = total_layers / page_size + i64::from(total_layers % page_size != 0);
    if page < 1 || page > total_pages {
        return Err(PaginationError::InvalidPage { page, total_pages });
    }

    let start_index = (page - 1) * page_size;
    let end_index = start_index.saturating_add(page_size).min(total_layers);

    Ok(Pagination {
        page,
        page_size,
        total_pages,
        start_index,
        end_index,
    })
}

/// Reject page sizes outside [1, max]
pub fn validate_page_size(page_size: i64, max: i64) -> Result<(), PaginationError> {
    if page_size < 1 || page_size > max {
        return Err(PaginationError::InvalidPageSize { page_size, max });
    }
    Ok(())
}
