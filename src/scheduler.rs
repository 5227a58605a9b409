use crate::events::{BridgeEvent, EventBus};
use crate::metrics;
use crate::models::{ImageRef, QueueStatus, RelistQueueEntry};
use crate::mutate;
use crate::reconcile::draft_from_item;
use crate::vault::{Vault, VaultError};
use crate::vinted::MarketplaceGateway;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Countdown bounds between finishing one entry and starting the next,
    /// in ticks. With the default one-second tick these read as seconds.
    pub min_countdown: i64,
    pub max_countdown: i64,
    pub tick: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let min_countdown = std::env::var("RELIST_MIN_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);
        let max_countdown = std::env::var("RELIST_MAX_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(180)
            .max(min_countdown);
        Self {
            min_countdown,
            max_countdown,
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub queue: Vec<RelistQueueEntry>,
    pub countdown: i64,
    pub processing: bool,
}

/// Owns the persisted relist queue and drains it on an irregular cadence:
/// strictly one entry in flight, a randomized countdown between entries,
/// and a stopped timer whenever the queue is empty. The irregular pacing is
/// an anti-pattern-detection measure, not a throughput knob.
#[derive(Clone)]
pub struct RelistScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    vault: Arc<Vault>,
    gateway: Arc<dyn MarketplaceGateway>,
    events: EventBus,
    config: SchedulerConfig,
    countdown: AtomicI64,
    processing: AtomicBool,
    wake: Notify,
}

impl RelistScheduler {
    pub fn spawn(
        vault: Arc<Vault>,
        gateway: Arc<dyn MarketplaceGateway>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            vault,
            gateway,
            events,
            config,
            countdown: AtomicI64::new(0),
            processing: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let worker = shared.clone();
        let handle = tokio::spawn(async move { run_loop(worker).await });
        (Self { shared }, handle)
    }

    /// Queue items for stealth resubmission. Items already carrying an
    /// active entry are skipped (duplicate enqueue is a no-op); ids without
    /// a vault record are ignored. Returns how many entries were created.
    pub async fn enqueue(&self, local_ids: &[i64]) -> Result<usize, VaultError> {
        let mut added = 0;
        for &local_id in local_ids {
            let Some(item) = self.shared.vault.get(local_id).await? else {
                warn!(
                    target = "vault.relist",
                    local_id = local_id,
                    "enqueue skipped unknown item"
                );
                continue;
            };
            if self
                .shared
                .vault
                .enqueue_entry(local_id, &item.title, item.relist_count)
                .await?
            {
                added += 1;
            }
        }
        if added > 0 {
            // First enqueue starts the timer.
            self.shared.wake.notify_one();
        }
        self.shared.emit().await;
        Ok(added)
    }

    pub async fn dequeue(&self, local_id: i64) -> Result<(), VaultError> {
        self.shared.vault.dequeue(local_id).await?;
        self.shared.emit().await;
        Ok(())
    }

    /// Remove all pending entries; anything already in flight runs to
    /// completion.
    pub async fn clear(&self) -> Result<usize, VaultError> {
        let removed = self.shared.vault.clear_pending().await?;
        self.shared.emit().await;
        Ok(removed)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, VaultError> {
        self.shared.snapshot().await
    }
}

impl Shared {
    async fn snapshot(&self) -> Result<QueueSnapshot, VaultError> {
        Ok(QueueSnapshot {
            queue: self.vault.queue_entries().await?,
            countdown: self.countdown.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
        })
    }

    async fn emit(&self) {
        match self.snapshot().await {
            Ok(snapshot) => {
                metrics::queue_depth(snapshot.queue.len());
                self.events.publish(BridgeEvent::QueueUpdate {
                    queue: snapshot.queue,
                    countdown: snapshot.countdown,
                    processing: snapshot.processing,
                });
            }
            Err(err) => warn!(target = "vault.relist", error = %err, "queue snapshot failed"),
        }
    }
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        let has_pending = matches!(shared.vault.oldest_pending().await, Ok(Some(_)));
        if !has_pending {
            // Empty queue stops the timer entirely; enqueue wakes us.
            shared.countdown.store(0, Ordering::SeqCst);
            shared.processing.store(false, Ordering::SeqCst);
            shared.emit().await;
            shared.wake.notified().await;
            continue;
        }

        let total = {
            let mut rng = rand::rng();
            rng.random_range(shared.config.min_countdown..=shared.config.max_countdown)
        };
        shared.countdown.store(total, Ordering::SeqCst);
        if total > 0 {
            shared.emit().await;
        }
        while shared.countdown.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(shared.config.tick).await;
            shared.countdown.fetch_sub(1, Ordering::SeqCst);
            shared.emit().await;
        }

        // The pending entry may have been dequeued during the countdown.
        let entry = match shared.vault.oldest_pending().await {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(err) => {
                warn!(target = "vault.relist", error = %err, "queue poll failed");
                continue;
            }
        };
        process_entry(&shared, entry).await;
    }
}

async fn process_entry(shared: &Arc<Shared>, entry: RelistQueueEntry) {
    let local_id = entry.local_id;
    let started = std::time::Instant::now();
    shared.processing.store(true, Ordering::SeqCst);

    match run_entry(shared, &entry).await {
        Ok(new_remote_id) => {
            let lock = shared.vault.item_lock(local_id).await;
            let _guard = lock.lock().await;
            let completed = shared.vault.complete_relist(local_id, new_remote_id).await;
            drop(_guard);
            match completed {
                Ok(()) => {
                    let _ = shared
                        .vault
                        .set_queue_status(local_id, QueueStatus::Done, None)
                        .await;
                    shared.emit().await;
                    let _ = shared.vault.remove_queue_entry(local_id).await;
                    info!(
                        target = "vault.relist",
                        local_id = local_id,
                        new_remote_id = new_remote_id,
                        "relist completed"
                    );
                }
                Err(err) => {
                    let message = format!("relist published but vault update failed: {err}");
                    warn!(target = "vault.relist", local_id = local_id, error = %err, "{message}");
                    let _ = shared
                        .vault
                        .set_queue_status(local_id, QueueStatus::Error, Some(&message))
                        .await;
                }
            }
        }
        Err(message) => {
            warn!(
                target = "vault.relist",
                local_id = local_id,
                error = %message,
                "relist failed; entry kept for inspection"
            );
            let _ = shared
                .vault
                .set_queue_status(local_id, QueueStatus::Error, Some(&message))
                .await;
        }
    }

    shared.processing.store(false, Ordering::SeqCst);
    metrics::op_elapsed("relist_entry", started.elapsed().as_millis());
    shared.emit().await;
}

/// One entry through `mutating` then `uploading`. Returns the new remote id
/// on success, a user-facing message on failure. Failures are terminal for
/// the entry; the user re-enqueues explicitly.
async fn run_entry(shared: &Arc<Shared>, entry: &RelistQueueEntry) -> Result<i64, String> {
    let local_id = entry.local_id;
    shared
        .vault
        .set_queue_status(local_id, QueueStatus::Mutating, None)
        .await
        .map_err(|err| err.to_string())?;
    shared.emit().await;

    let item = shared
        .vault
        .get(local_id)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "item was deleted while queued".to_string())?;
    let old_remote_id = item
        .remote_id
        .ok_or_else(|| "item is not linked to a remote listing".to_string())?;

    let jittered_title = mutate::jitter_title(&item.title, entry.relist_count);

    let mut images = Vec::new();
    for image in &item.images {
        let loaded = match image {
            ImageRef::Remote { url } => shared.gateway.fetch_image(url).await.map_err(|err| {
                format!("photo fetch failed: {err}")
            }),
            ImageRef::Local { path } => tokio::fs::read(path)
                .await
                .map_err(|err| format!("photo read failed ({path}): {err}")),
        };
        match loaded {
            Ok(bytes) => images.push(bytes),
            Err(message) => {
                warn!(target = "vault.relist", local_id = local_id, "{message}");
            }
        }
    }
    if images.is_empty() {
        return Err("no readable photos; relist needs at least one".to_string());
    }

    let thumbnail = mutate::mutate_image(&images[0], entry.relist_count)
        .ok()
        .map(|bytes| BASE64.encode(bytes));
    shared
        .vault
        .set_queue_mutation(local_id, &jittered_title, thumbnail.as_deref())
        .await
        .map_err(|err| err.to_string())?;

    shared
        .vault
        .set_queue_status(local_id, QueueStatus::Uploading, None)
        .await
        .map_err(|err| err.to_string())?;
    shared.emit().await;

    let mut draft = draft_from_item(&item);
    draft.title = jittered_title;
    draft.description = draft
        .description
        .map(|description| mutate::jitter_title(&description, entry.relist_count));

    let outcome = shared
        .gateway
        .relist_listing(old_remote_id, &draft, images, entry.relist_count)
        .await
        .map_err(|err| err.to_string())?;
    Ok(outcome.new_remote_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemPatch, ItemStatus, OntologyEntity, OntologyType};
    use crate::vinted::{
        GatewayError, ListingDraft, RelistOutcome, RemoteItemDetail, RemoteListing,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RelistFake {
        active: AtomicUsize,
        max_active: AtomicUsize,
        next_id: AtomicUsize,
        order: AsyncMutex<Vec<i64>>,
        fail_for: AsyncMutex<Vec<i64>>,
    }

    #[async_trait]
    impl MarketplaceGateway for RelistFake {
        async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, GatewayError> {
            Ok(vec![])
        }
        async fn fetch_item_detail(&self, id: i64) -> Result<RemoteItemDetail, GatewayError> {
            Err(GatewayError::NotFound(id))
        }
        async fn create_listing(&self, _: &ListingDraft) -> Result<i64, GatewayError> {
            unimplemented!("not used in scheduler tests")
        }
        async fn update_listing(&self, _: i64, _: &ListingDraft) -> Result<(), GatewayError> {
            unimplemented!("not used in scheduler tests")
        }
        async fn delete_listing(&self, _: i64) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn fetch_image(&self, _: &str) -> Result<Vec<u8>, GatewayError> {
            Ok(vec![0xFF, 0xD8, 0xFF])
        }
        async fn relist_listing(
            &self,
            old_remote_id: i64,
            _draft: &ListingDraft,
            images: Vec<Vec<u8>>,
            _relist_count: i64,
        ) -> Result<RelistOutcome, GatewayError> {
            assert!(!images.is_empty());
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_for.lock().await.contains(&old_remote_id) {
                return Err(GatewayError::Request("HTTP 500".into()));
            }
            self.order.lock().await.push(old_remote_id);
            let new_id = 1000 + self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(RelistOutcome {
                new_remote_id: new_id,
                photo_ids: vec![1],
            })
        }
        async fn fetch_taxonomy(
            &self,
            _: OntologyType,
        ) -> Result<Vec<OntologyEntity>, GatewayError> {
            Ok(vec![])
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            min_countdown: 0,
            max_countdown: 0,
            tick: Duration::from_millis(5),
        }
    }

    async fn seed_item(vault: &Vault, remote_id: i64, title: &str) -> i64 {
        let item = vault
            .upsert(ItemPatch {
                title: Some(title.to_string()),
                remote_id: Some(remote_id),
                price: Some(10.0),
                images: Some(vec![ImageRef::Remote {
                    url: format!("https://cdn.example/{remote_id}.jpg"),
                }]),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        item.local_id
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn queue_drains_fifo_with_single_flight() {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let gateway = Arc::new(RelistFake::default());
        let (scheduler, _worker) = RelistScheduler::spawn(
            vault.clone(),
            gateway.clone(),
            EventBus::new(),
            test_config(),
        );

        let mut ids = Vec::new();
        for n in 1..=3i64 {
            ids.push(seed_item(&vault, n, &format!("item-{n}")).await);
        }
        let added = scheduler.enqueue(&ids).await.unwrap();
        assert_eq!(added, 3);

        let vault_done = vault.clone();
        wait_until(|| {
            let vault = vault_done.clone();
            async move { vault.queue_entries().await.unwrap().is_empty() }
        })
        .await;

        // Processed in enqueue order, never more than one in flight.
        assert_eq!(*gateway.order.lock().await, vec![1, 2, 3]);
        assert_eq!(gateway.max_active.load(Ordering::SeqCst), 1);

        // Each item relinked to its replacement with the counter advanced.
        for (idx, &local_id) in ids.iter().enumerate() {
            let item = vault.get(local_id).await.unwrap().unwrap();
            assert_eq!(item.relist_count, 1);
            assert_eq!(item.remote_id, Some(1000 + idx as i64));
            assert_eq!(item.status, ItemStatus::Live);
        }
    }

    #[tokio::test]
    async fn failed_entry_becomes_terminal_error() {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let gateway = Arc::new(RelistFake::default());
        gateway.fail_for.lock().await.push(1);
        let (scheduler, _worker) = RelistScheduler::spawn(
            vault.clone(),
            gateway.clone(),
            EventBus::new(),
            test_config(),
        );

        let failing = seed_item(&vault, 1, "doomed").await;
        let fine = seed_item(&vault, 2, "fine").await;
        scheduler.enqueue(&[failing, fine]).await.unwrap();

        let vault_poll = vault.clone();
        wait_until(|| {
            let vault = vault_poll.clone();
            async move {
                let entries = vault.queue_entries().await.unwrap();
                entries.len() == 1 && entries[0].status == QueueStatus::Error
            }
        })
        .await;

        let entries = vault.queue_entries().await.unwrap();
        assert_eq!(entries[0].local_id, failing);
        assert!(entries[0].error.as_deref().unwrap().contains("HTTP 500"));
        // The failed item's counter did not advance; the other one's did.
        assert_eq!(vault.get(failing).await.unwrap().unwrap().relist_count, 0);
        assert_eq!(vault.get(fine).await.unwrap().unwrap().relist_count, 1);

        // No auto-retry: the error entry stays put.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let entries = vault.queue_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QueueStatus::Error);
    }

    #[tokio::test]
    async fn countdown_runs_between_entries_and_stops_when_empty() {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let gateway = Arc::new(RelistFake::default());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let config = SchedulerConfig {
            min_countdown: 2,
            max_countdown: 2,
            tick: Duration::from_millis(10),
        };
        let (scheduler, _worker) =
            RelistScheduler::spawn(vault.clone(), gateway.clone(), events, config);

        let local_id = seed_item(&vault, 1, "paced").await;
        scheduler.enqueue(&[local_id]).await.unwrap();

        let vault_poll = vault.clone();
        wait_until(|| {
            let vault = vault_poll.clone();
            async move { vault.queue_entries().await.unwrap().is_empty() }
        })
        .await;

        let mut saw_countdown = false;
        let mut saw_processing = false;
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::QueueUpdate {
                countdown,
                processing,
                ..
            } = event
            {
                saw_countdown |= countdown > 0;
                saw_processing |= processing;
            }
        }
        assert!(saw_countdown, "expected a nonzero countdown before processing");
        assert!(saw_processing, "expected a processing tick");

        // Idle queue: countdown parked at zero.
        let snapshot = scheduler.snapshot().await.unwrap();
        assert_eq!(snapshot.countdown, 0);
        assert!(!snapshot.processing);
        assert!(snapshot.queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_during_countdown_cancels_processing() {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let gateway = Arc::new(RelistFake::default());
        let config = SchedulerConfig {
            min_countdown: 30,
            max_countdown: 30,
            tick: Duration::from_millis(20),
        };
        let (scheduler, _worker) =
            RelistScheduler::spawn(vault.clone(), gateway.clone(), EventBus::new(), config);

        let local_id = seed_item(&vault, 1, "cancelled").await;
        scheduler.enqueue(&[local_id]).await.unwrap();
        // Give the loop a moment to start the countdown, then cancel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.dequeue(local_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(gateway.order.lock().await.is_empty());
        assert_eq!(vault.get(local_id).await.unwrap().unwrap().relist_count, 0);
    }

    #[tokio::test]
    async fn unlinked_item_errors_without_network() {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let gateway = Arc::new(RelistFake::default());
        let (scheduler, _worker) = RelistScheduler::spawn(
            vault.clone(),
            gateway.clone(),
            EventBus::new(),
            test_config(),
        );

        let item = vault
            .upsert(ItemPatch {
                title: Some("local only".into()),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        scheduler.enqueue(&[item.local_id]).await.unwrap();

        let vault_poll = vault.clone();
        wait_until(|| {
            let vault = vault_poll.clone();
            async move {
                let entries = vault.queue_entries().await.unwrap();
                !entries.is_empty() && entries[0].status == QueueStatus::Error
            }
        })
        .await;
        let entries = vault.queue_entries().await.unwrap();
        assert!(entries[0]
            .error
            .as_deref()
            .unwrap()
            .contains("not linked"));
        assert!(gateway.order.lock().await.is_empty());
    }
}
