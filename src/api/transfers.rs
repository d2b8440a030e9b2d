// Transfer-Related API Endpoints

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::helpers::{bad_request, internal_error, paging, total_pages, ApiResult};
use super::types::{PageQuery, Paged, TransferView};
use super::ApiContext;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TransferQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    /// Filter by token contract address.
    pub token: Option<String>,
    /// Filter by sender or recipient address.
    pub address: Option<String>,
    /// Filter by block number.
    pub block: Option<u64>,
}

fn checked_address(value: &str, name: &str) -> Result<String, (axum::http::StatusCode, Json<super::types::ApiError>)> {
    let lower = value.to_ascii_lowercase();
    let shaped = lower.len() == 42
        && lower.starts_with("0x")
        && lower[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if !shaped {
        return Err(bad_request(format!(
            "{name} must be a 0x-prefixed 20-byte address"
        )));
    }
    Ok(lower)
}

/// GET /api/v1/transfers?page=&limit=&token=&address=&block=
/// Newest-first page of transfers, optionally filtered.
pub async fn list_transfers(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<Paged<TransferView>> {
    let page_query = PageQuery {
        page: query.page,
        limit: query.limit,
    };
    let (page, limit, offset) = paging(&page_query);

    let token = query
        .token
        .as_deref()
        .map(|t| checked_address(t, "token"))
        .transpose()?;
    let address = query
        .address
        .as_deref()
        .map(|a| checked_address(a, "address"))
        .transpose()?;

    let (transfers, total) = ctx
        .store
        .list_transfers(
            token.as_deref(),
            address.as_deref(),
            query.block,
            offset,
            limit,
        )
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    ctx.metrics
        .http_requests
        .with_label_values(&["/api/v1/transfers", "200"])
        .inc();
    Ok(Json(Paged {
        page,
        total_pages: total_pages(total, limit),
        items_on_page: transfers.len() as u64,
        items: transfers.into_iter().map(Into::into).collect(),
    }))
}
