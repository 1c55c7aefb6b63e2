use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::error_response;
use crate::{
    api::AppState,
    content::{Banner, Catalog, Section},
};

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SectionSummary {
    pub permalink: String,
    pub title: String,
    pub position: i32,
    /// Effective preview length, falling back to the configured default.
    pub preview_length: u32,
    pub pages: Vec<String>,
}

impl SectionSummary {
    fn new(catalog: &Catalog, section: &Section) -> Self {
        Self {
            permalink: section.permalink.clone(),
            title: section.title.clone(),
            position: section.position,
            preview_length: catalog.preview_length_or_default(section),
            pages: section.pages.iter().map(|page| page.title.clone()).collect(),
        }
    }
}

#[utoipa::path(
    get,
    path= "/v1/sections",
    responses (
        (status = 200, description = "Sections in ascending position", body = [SectionSummary]),
    ),
    tag= "sections"
)]
pub async fn list(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let catalog = state.catalog.as_ref();
    let sections: Vec<SectionSummary> = catalog
        .sections()
        .iter()
        .map(|section| SectionSummary::new(catalog, section))
        .collect();
    Json(sections)
}

#[utoipa::path(
    get,
    path= "/v1/sections/{permalink}",
    params(("permalink" = String, Path, description = "Section permalink")),
    responses (
        (status = 200, description = "Section with its pages", body = Section),
        (status = 404, description = "Unknown section", body = super::ErrorBody),
    ),
    tag= "sections"
)]
pub async fn show(Path(permalink): Path<String>, state: Extension<Arc<AppState>>) -> Response {
    state.catalog.find(&permalink).map_or_else(
        || error_response(StatusCode::NOT_FOUND, "Section not found"),
        |section| (StatusCode::OK, Json(section.clone())).into_response(),
    )
}

#[utoipa::path(
    get,
    path= "/v1/banners",
    responses (
        (status = 200, description = "Page banners in section then page order", body = [Banner]),
    ),
    tag= "sections"
)]
pub async fn banners(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let banners: Vec<Banner> = state.catalog.banners().into_iter().cloned().collect();
    Json(banners)
}
