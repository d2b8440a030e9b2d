// Block-Related API Endpoints

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;

use crate::store::BlockStore;

use super::helpers::{bad_request, internal_error, not_found, paging, total_pages, ApiResult};
use super::types::{BlockDetail, BlockView, PageQuery, Paged};
use super::ApiContext;

/// GET /api/v1/blocks?page=&limit=
/// Newest-first page of blocks.
pub async fn list_blocks(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Paged<BlockView>> {
    let (page, limit, offset) = paging(&query);

    let total = ctx
        .store
        .count_blocks()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let blocks = ctx
        .store
        .list_blocks(offset, limit)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    ctx.metrics
        .http_requests
        .with_label_values(&["/api/v1/blocks", "200"])
        .inc();
    Ok(Json(Paged {
        page,
        total_pages: total_pages(total, limit),
        items_on_page: blocks.len() as u64,
        items: blocks.into_iter().map(BlockView::from).collect(),
    }))
}

/// GET /api/v1/blocks/{id}
/// Single block by height or 0x-prefixed hash, with its transfers.
pub async fn get_block(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> ApiResult<BlockDetail> {
    let block = if let Ok(number) = id.parse::<u64>() {
        ctx.store
            .find_by_height(number)
            .await
            .map_err(|e| internal_error(e.to_string()))?
    } else if id.starts_with("0x") && id.len() == 66 {
        ctx.store
            .find_by_hash(&id.to_ascii_lowercase())
            .await
            .map_err(|e| internal_error(e.to_string()))?
    } else {
        return Err(bad_request(
            "id must be a block height or a 0x-prefixed 32-byte hash",
        ));
    };

    let block = block.ok_or_else(|| not_found(format!("block {id} not found")))?;
    let transfers = ctx
        .store
        .transfers_for_block(block.number)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    ctx.metrics
        .http_requests
        .with_label_values(&["/api/v1/blocks/{id}", "200"])
        .inc();
    Ok(Json(BlockDetail {
        block: BlockView::from(block),
        transfers: transfers.into_iter().map(Into::into).collect(),
    }))
}
