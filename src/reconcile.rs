use crate::events::{BridgeEvent, EventBus, SyncStage};
use crate::models::{DiscrepancyReason, InventoryItem, ItemPatch, ItemStatus, OntologyType};
use crate::vault::{Vault, VaultError};
use crate::vinted::{
    GatewayError, ListingDraft, MarketplaceGateway, RemoteItemDetail, RemoteListing,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Full-detail cache freshness window.
pub const DETAIL_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("reconciliation already in progress")]
    Busy,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub total_remote: usize,
    pub created: usize,
    pub refreshed: usize,
    pub flagged: usize,
    pub marked_sold: usize,
    pub failures: Vec<SyncFailure>,
}

#[derive(Debug, Serialize)]
pub struct SyncFailure {
    pub remote_id: i64,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct DetailReport {
    pub complete: bool,
    pub hydrated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_hydrated_at: Option<i64>,
}

/// Keeps the vault consistent with the remote account: snapshot diffing,
/// lazy detail hydration, and the explicit push/pull conflict resolutions.
pub struct SyncEngine {
    vault: Arc<Vault>,
    gateway: Arc<dyn MarketplaceGateway>,
    events: EventBus,
    /// Whole-account reconciliation runs are serialized; a second run is
    /// rejected, not queued.
    run_guard: Arc<Mutex<()>>,
}

enum ItemOutcome {
    Created,
    Refreshed,
    Flagged,
}

impl SyncEngine {
    pub fn new(vault: Arc<Vault>, gateway: Arc<dyn MarketplaceGateway>, events: EventBus) -> Self {
        Self {
            vault,
            gateway,
            events,
            run_guard: Arc::new(Mutex::new(())),
        }
    }

    fn try_begin(&self) -> Result<OwnedMutexGuard<()>, SyncError> {
        self.run_guard
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::Busy)
    }

    /// Run one reconciliation pass, rejecting synchronously if one is
    /// already in flight.
    pub async fn pull_account(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.try_begin()?;
        self.reconcile().await
    }

    /// Reject-or-spawn variant for the command surface: the conflict check
    /// happens before this returns, the pass itself runs in the background
    /// and reports through sync-progress events.
    pub fn spawn_pull(self: Arc<Self>) -> Result<(), SyncError> {
        let guard = self.try_begin()?;
        let engine = self;
        tokio::spawn(async move {
            let _guard = guard;
            match engine.reconcile().await {
                Ok(report) => info!(
                    target = "vault.sync",
                    created = report.created,
                    refreshed = report.refreshed,
                    flagged = report.flagged,
                    marked_sold = report.marked_sold,
                    failures = report.failures.len(),
                    "reconciliation finished"
                ),
                Err(err) => warn!(target = "vault.sync", error = %err, "reconciliation failed"),
            }
        });
        Ok(())
    }

    async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        let started = std::time::Instant::now();
        self.events.publish(BridgeEvent::SyncProgress {
            stage: SyncStage::Starting,
            current: None,
            total: None,
        });

        let snapshot = self.gateway.fetch_listings().await?;
        let total = snapshot.len();
        let mut report = SyncReport {
            total_remote: total,
            ..SyncReport::default()
        };
        let mut seen = HashSet::new();

        for (idx, remote) in snapshot.iter().enumerate() {
            seen.insert(remote.remote_id);
            // Best effort per item: one failure is recorded and the batch
            // moves on.
            match self.reconcile_one(remote).await {
                Ok(ItemOutcome::Created) => report.created += 1,
                Ok(ItemOutcome::Refreshed) => report.refreshed += 1,
                Ok(ItemOutcome::Flagged) => report.flagged += 1,
                Err(err) => {
                    warn!(
                        target = "vault.sync",
                        remote_id = remote.remote_id,
                        error = %err,
                        "item reconciliation failed; continuing"
                    );
                    report.failures.push(SyncFailure {
                        remote_id: remote.remote_id,
                        error: err.to_string(),
                    });
                }
            }
            self.events.publish(BridgeEvent::SyncProgress {
                stage: SyncStage::Progress,
                current: Some(idx + 1),
                total: Some(total),
            });
        }

        // Linked items that vanished from the snapshot were removed or sold
        // upstream. An item with an active queue entry is left alone; the
        // scheduler owns its error handling.
        for item in self.vault.list(None).await? {
            let Some(remote_id) = item.remote_id else {
                continue;
            };
            if seen.contains(&remote_id) || item.status == ItemStatus::Sold {
                continue;
            }
            if self.vault.has_active_entry(item.local_id).await? {
                continue;
            }
            self.vault
                .set_status(item.local_id, ItemStatus::Sold, None)
                .await?;
            report.marked_sold += 1;
        }

        self.events.publish(BridgeEvent::SyncProgress {
            stage: SyncStage::Done,
            current: Some(total),
            total: Some(total),
        });
        crate::metrics::op_elapsed("reconcile", started.elapsed().as_millis());
        Ok(report)
    }

    async fn reconcile_one(&self, remote: &RemoteListing) -> Result<ItemOutcome, SyncError> {
        let Some(existing) = self.vault.get_by_remote(remote.remote_id).await? else {
            let created = self
                .vault
                .upsert(ItemPatch {
                    remote_id: Some(remote.remote_id),
                    title: Some(remote.title.clone()),
                    price: remote.price,
                    currency: remote.currency.clone(),
                    category_id: remote.category_id,
                    ..ItemPatch::default()
                })
                .await?;
            let status = remote.lifecycle.as_item_status();
            if status != ItemStatus::Live {
                self.vault.set_status(created.local_id, status, None).await?;
            }
            return Ok(ItemOutcome::Created);
        };

        let lock = self.vault.item_lock(existing.local_id).await;
        let _guard = lock.lock().await;
        // Re-read under the lock; a manual edit may have landed meanwhile.
        let item = self
            .vault
            .get(existing.local_id)
            .await?
            .ok_or(VaultError::NotFound(existing.local_id))?;

        // Items already waiting on the user keep their conflict marker.
        if matches!(
            item.status,
            ItemStatus::Discrepancy | ItemStatus::ActionRequired
        ) {
            return Ok(ItemOutcome::Refreshed);
        }

        if fields_match(&item, remote) {
            let status = remote.lifecycle.as_item_status();
            if item.status != status {
                self.vault.set_status(item.local_id, status, None).await?;
            }
            Ok(ItemOutcome::Refreshed)
        } else {
            // A divergence is a conflict marker, never an auto-merge; the
            // user resolves it with an explicit push or pull.
            self.vault
                .set_status(
                    item.local_id,
                    ItemStatus::Discrepancy,
                    Some(DiscrepancyReason::ExternalChange),
                )
                .await?;
            Ok(ItemOutcome::Flagged)
        }
    }

    // ── Detail hydration ─────────────────────────────────────────────────

    /// Hydrate the full-detail fields when the cache is stale or
    /// incomplete. A failed fetch degrades to the last known fields and
    /// never surfaces as an error; editing must not be blocked.
    pub async fn ensure_detail(
        &self,
        local_id: i64,
        force: bool,
    ) -> Result<DetailReport, SyncError> {
        let item = self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?;
        let Some(remote_id) = item.remote_id else {
            // Local-only items have nothing to hydrate from.
            return Ok(DetailReport {
                complete: detail_complete(&item),
                hydrated: false,
                detail_hydrated_at: item.detail_hydrated_at,
            });
        };

        let now = Utc::now().timestamp();
        let fresh = item
            .detail_hydrated_at
            .is_some_and(|at| now - at < DETAIL_TTL_SECS);
        if !force && fresh && detail_complete(&item) {
            return Ok(DetailReport {
                complete: true,
                hydrated: false,
                detail_hydrated_at: item.detail_hydrated_at,
            });
        }

        match self.gateway.fetch_item_detail(remote_id).await {
            Ok(detail) => {
                let lock = self.vault.item_lock(local_id).await;
                let _guard = lock.lock().await;
                let updated = self
                    .vault
                    .upsert(detail_patch(local_id, &detail))
                    .await?;
                self.vault.set_detail_hydrated(local_id, now).await?;
                Ok(DetailReport {
                    complete: detail_complete(&updated),
                    hydrated: true,
                    detail_hydrated_at: Some(now),
                })
            }
            Err(err) => {
                warn!(
                    target = "vault.sync",
                    local_id = local_id,
                    error = %err,
                    "detail hydration failed; keeping last known fields"
                );
                Ok(DetailReport {
                    complete: detail_complete(&item),
                    hydrated: false,
                    detail_hydrated_at: item.detail_hydrated_at,
                })
            }
        }
    }

    // ── Explicit conflict resolution ─────────────────────────────────────

    /// Push the local record to the platform: create when unlinked, update
    /// when linked. Validation failures close the gate before any network
    /// call.
    pub async fn push_item(&self, local_id: i64) -> Result<InventoryItem, SyncError> {
        let lock = self.vault.item_lock(local_id).await;
        let _guard = lock.lock().await;
        let item = self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?;

        self.validate_push(&item).await?;
        let draft = draft_from_item(&item);

        match item.remote_id {
            None => {
                let remote_id = self.gateway.create_listing(&draft).await?;
                self.vault
                    .upsert(ItemPatch {
                        local_id: Some(local_id),
                        remote_id: Some(remote_id),
                        ..ItemPatch::default()
                    })
                    .await?;
                self.vault
                    .set_status(local_id, ItemStatus::Live, None)
                    .await?;
            }
            Some(remote_id) => {
                if let Err(err) = self.gateway.update_listing(remote_id, &draft).await {
                    self.vault
                        .set_status(
                            local_id,
                            ItemStatus::Discrepancy,
                            Some(DiscrepancyReason::FailedPush),
                        )
                        .await?;
                    return Err(err.into());
                }
                self.vault
                    .set_status(local_id, ItemStatus::Live, None)
                    .await?;
            }
        }
        Ok(self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?)
    }

    async fn validate_push(&self, item: &InventoryItem) -> Result<(), SyncError> {
        if item.status == ItemStatus::ActionRequired {
            return Err(SyncError::Validation(
                "stored category no longer exists in the taxonomy; fix it before pushing".into(),
            ));
        }
        if item.title.trim().is_empty() {
            return Err(SyncError::Validation("title is required".into()));
        }
        if item.price.is_none() {
            return Err(SyncError::Validation("price is required".into()));
        }
        let Some(category_id) = item.category_id else {
            return Err(SyncError::Validation("category is required".into()));
        };
        // Validate against the mirror only once it has been populated.
        let known = self.vault.ontology_ids(OntologyType::Category).await?;
        if !known.is_empty() && !known.contains(&category_id) {
            self.vault
                .set_status(item.local_id, ItemStatus::ActionRequired, None)
                .await?;
            return Err(SyncError::Validation(format!(
                "category {category_id} is not present in the current taxonomy"
            )));
        }
        Ok(())
    }

    /// Accept the remote version wholesale and clear the conflict marker.
    pub async fn pull_live(&self, local_id: i64) -> Result<InventoryItem, SyncError> {
        let lock = self.vault.item_lock(local_id).await;
        let _guard = lock.lock().await;
        let item = self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?;
        let remote_id = item.remote_id.ok_or_else(|| {
            SyncError::Validation("item is not linked to a remote listing".into())
        })?;

        let detail = self.gateway.fetch_item_detail(remote_id).await?;
        self.vault.upsert(detail_patch(local_id, &detail)).await?;
        self.vault
            .set_status(local_id, detail.lifecycle.as_item_status(), None)
            .await?;
        self.vault
            .set_detail_hydrated(local_id, Utc::now().timestamp())
            .await?;
        Ok(self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?)
    }

    /// Apply a local patch and push it to the live listing in one step; a
    /// failed push leaves the local edit in place under a `failed_push`
    /// discrepancy marker.
    pub async fn edit_live(
        &self,
        local_id: i64,
        patch: ItemPatch,
    ) -> Result<InventoryItem, SyncError> {
        let lock = self.vault.item_lock(local_id).await;
        let _guard = lock.lock().await;
        let item = self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?;
        let Some(remote_id) = item.remote_id else {
            return Err(SyncError::Validation(
                "item is not linked to a remote listing".into(),
            ));
        };

        let patched = self
            .vault
            .upsert(ItemPatch {
                local_id: Some(local_id),
                remote_id: None,
                ..patch
            })
            .await?;
        let draft = draft_from_item(&patched);
        if let Err(err) = self.gateway.update_listing(remote_id, &draft).await {
            self.vault
                .set_status(
                    local_id,
                    ItemStatus::Discrepancy,
                    Some(DiscrepancyReason::FailedPush),
                )
                .await?;
            return Err(err.into());
        }
        self.vault
            .set_status(local_id, ItemStatus::Live, None)
            .await?;
        Ok(self
            .vault
            .get(local_id)
            .await?
            .ok_or(VaultError::NotFound(local_id))?)
    }
}

fn detail_complete(item: &InventoryItem) -> bool {
    item.category_id.is_some() && item.description.is_some() && item.price.is_some()
}

fn detail_patch(local_id: i64, detail: &RemoteItemDetail) -> ItemPatch {
    ItemPatch {
        local_id: Some(local_id),
        remote_id: None,
        title: detail.title.clone(),
        description: detail.description.clone(),
        price: detail.price,
        currency: detail.currency.clone(),
        category_id: detail.category_id,
        brand_id: detail.brand_id,
        size_id: detail.size_id,
        condition_id: detail.condition_id,
        package_size_id: detail.package_size_id,
        color_ids: if detail.color_ids.is_empty() {
            None
        } else {
            Some(detail.color_ids.clone())
        },
        attributes: if detail.attributes.is_empty() {
            None
        } else {
            Some(detail.attributes.clone())
        },
        images: if detail.photo_urls.is_empty() {
            None
        } else {
            Some(
                detail
                    .photo_urls
                    .iter()
                    .map(|url| crate::models::ImageRef::Remote { url: url.clone() })
                    .collect(),
            )
        },
    }
}

pub(crate) fn draft_from_item(item: &InventoryItem) -> ListingDraft {
    ListingDraft {
        title: item.title.clone(),
        description: item.description.clone(),
        price: item.price,
        currency: item.currency.clone(),
        category_id: item.category_id,
        brand_id: item.brand_id,
        size_id: item.size_id,
        condition_id: item.condition_id,
        package_size_id: item.package_size_id,
        color_ids: item.color_ids.clone(),
        attributes: item.attributes.clone(),
    }
}

/// Summary comparison: only fields the snapshot actually carries count, so
/// a sparse summary row cannot manufacture a conflict.
fn fields_match(item: &InventoryItem, remote: &RemoteListing) -> bool {
    if item.title != remote.title {
        return false;
    }
    if let Some(remote_price) = remote.price {
        match item.price {
            Some(local_price) if (local_price - remote_price).abs() < 0.005 => {}
            _ => return false,
        }
    }
    if let Some(remote_category) = remote.category_id
        && item.category_id != Some(remote_category)
    {
        return false;
    }
    true
}
