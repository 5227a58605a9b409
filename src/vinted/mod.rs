pub mod client;
pub mod config;
pub mod items;
pub mod normalize;
pub mod photos;
pub mod taxonomy;
pub mod wardrobe;

pub use client::VintedGateway;

use crate::models::{ItemAttribute, ItemStatus, OntologyEntity, OntologyType};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy for remote platform calls. Everything a call can go
/// wrong with becomes a value here; the core treats these as data, never as
/// panics, and decides per status whether to surface, degrade or mark an
/// item.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session expired or invalid cookie")]
    SessionExpired,
    #[error("access forbidden (bot detection?)")]
    Forbidden,
    #[error("rate limited by remote platform")]
    RateLimited,
    #[error("bot challenge detected; refresh the session in a browser")]
    Challenge,
    #[error("listing {0} not found")]
    NotFound(i64),
    #[error("gateway not configured: {0}")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Parse(String),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Remote-reported lifecycle of a listing, derived from the summary flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteLifecycle {
    Live,
    Hidden,
    Reserved,
    Sold,
}

impl RemoteLifecycle {
    pub fn as_item_status(&self) -> ItemStatus {
        match self {
            RemoteLifecycle::Live => ItemStatus::Live,
            RemoteLifecycle::Hidden => ItemStatus::Hidden,
            RemoteLifecycle::Reserved => ItemStatus::Reserved,
            RemoteLifecycle::Sold => ItemStatus::Sold,
        }
    }
}

/// One entry of the account listing snapshot. Summary fields only; full
/// detail comes from `fetch_item_detail`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteListing {
    pub remote_id: i64,
    pub title: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub category_id: Option<i64>,
    pub lifecycle: RemoteLifecycle,
}

/// Canonical full detail of one listing. The normalization layer resolves
/// every ambiguous payload shape into this struct before it reaches the
/// core; nothing downstream branches on wire shapes.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteItemDetail {
    pub remote_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub category_id: Option<i64>,
    pub brand_id: Option<i64>,
    pub size_id: Option<i64>,
    pub condition_id: Option<i64>,
    pub package_size_id: Option<i64>,
    pub color_ids: Vec<i64>,
    pub attributes: Vec<ItemAttribute>,
    pub photo_urls: Vec<String>,
    pub lifecycle: RemoteLifecycle,
}

/// Outbound listing payload for create/update/relist.
#[derive(Debug, Clone, Serialize)]
pub struct ListingDraft {
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub category_id: Option<i64>,
    pub brand_id: Option<i64>,
    pub size_id: Option<i64>,
    pub condition_id: Option<i64>,
    pub package_size_id: Option<i64>,
    pub color_ids: Vec<i64>,
    pub attributes: Vec<ItemAttribute>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelistOutcome {
    pub new_remote_id: i64,
    pub photo_ids: Vec<i64>,
}

/// Network operations the core depends on. The production implementation is
/// [`VintedGateway`]; tests drive the engines with in-memory fakes.
#[async_trait]
pub trait MarketplaceGateway: Send + Sync {
    /// Snapshot of every listing on the account (pagination is internal).
    async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, GatewayError>;

    async fn fetch_item_detail(&self, remote_id: i64) -> Result<RemoteItemDetail, GatewayError>;

    /// Create and publish a listing; returns the new remote id.
    async fn create_listing(&self, draft: &ListingDraft) -> Result<i64, GatewayError>;

    async fn update_listing(
        &self,
        remote_id: i64,
        draft: &ListingDraft,
    ) -> Result<(), GatewayError>;

    async fn delete_listing(&self, remote_id: i64) -> Result<(), GatewayError>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, GatewayError>;

    /// Full stealth relist sequence under one session: mutate and upload the
    /// photos, delete the old listing, pause, publish the replacement.
    async fn relist_listing(
        &self,
        old_remote_id: i64,
        draft: &ListingDraft,
        images: Vec<Vec<u8>>,
        relist_count: i64,
    ) -> Result<RelistOutcome, GatewayError>;

    async fn fetch_taxonomy(
        &self,
        kind: OntologyType,
    ) -> Result<Vec<OntologyEntity>, GatewayError>;
}
