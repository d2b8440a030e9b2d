// API Helper Functions
//
// Shared error responses and pagination arithmetic.

use axum::http::StatusCode;
use axum::Json;

use super::types::{ApiError, PageQuery};

/// Standard result type for API handlers.
pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn not_found(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError::new(message)))
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
}

pub fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
}

pub const DEFAULT_PAGE_LIMIT: u64 = 25;
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Resolve page/limit query params to (page, limit, row offset).
/// Pages are 1-based; limit clamps to 1..=100.
pub fn paging(query: &PageQuery) -> (u64, u64, u64) {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let offset = (page - 1).saturating_mul(limit);
    (page, limit, offset)
}

/// Total page count for an item count, never zero pages.
pub fn total_pages(total: u64, limit: u64) -> u64 {
    if total == 0 {
        1
    } else {
        total.div_ceil(limit)
    }
}
