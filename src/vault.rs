use crate::models::{
    DiscrepancyReason, InventoryItem, ItemAttribute, ImageRef, ItemPatch, ItemStatus,
    OntologyEntity, OntologyType, QueueStatus, RelistQueueEntry,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("item {0} not found")]
    NotFound(i64),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("remote id {0} already linked to another item")]
    DuplicateRemote(i64),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<rusqlite::Error> for VaultError {
    fn from(value: rusqlite::Error) -> Self {
        VaultError::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(value: serde_json::Error) -> Self {
        VaultError::Encoding(value.to_string())
    }
}

/// Durable local mirror of the account's inventory plus the relist queue and
/// the ontology mirror, all in one SQLite database.
///
/// The connection mutex serializes statement execution; `item_lock` hands out
/// per-item write locks so higher layers can make read-modify-write
/// sequences on one item single-writer without blocking unrelated items.
pub struct Vault {
    conn: Mutex<Connection>,
    item_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    local_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id           INTEGER,
    status              TEXT NOT NULL,
    discrepancy_reason  TEXT,
    title               TEXT NOT NULL DEFAULT '',
    description         TEXT,
    price               REAL,
    currency            TEXT,
    category_id         INTEGER,
    brand_id            INTEGER,
    size_id             INTEGER,
    condition_id        INTEGER,
    package_size_id     INTEGER,
    color_ids           TEXT NOT NULL DEFAULT '[]',
    attributes          TEXT NOT NULL DEFAULT '[]',
    images              TEXT NOT NULL DEFAULT '[]',
    relist_count        INTEGER NOT NULL DEFAULT 0,
    detail_hydrated_at  INTEGER,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_items_remote_id
    ON items(remote_id) WHERE remote_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS relist_queue (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    local_id            INTEGER NOT NULL UNIQUE,
    status              TEXT NOT NULL,
    error               TEXT,
    jittered_title      TEXT NOT NULL,
    mutated_thumbnail   TEXT,
    relist_count        INTEGER NOT NULL,
    enqueued_at         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ontology (
    entity_type TEXT NOT NULL,
    entity_id   INTEGER NOT NULL,
    parent_id   INTEGER,
    name        TEXT NOT NULL,
    extra       TEXT,
    PRIMARY KEY (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS ontology_meta (
    entity_type TEXT PRIMARY KEY,
    fetched_at  INTEGER NOT NULL
);
";

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

impl Vault {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, VaultError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, VaultError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        // journal_mode returns a row; in-memory databases stay on `memory`.
        let _: Result<String, _> =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0));
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            item_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Per-item write lock. Callers hold it across read-modify-write
    /// sequences on a single item; different items never contend.
    pub async fn item_lock(&self, local_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.item_locks.lock().await;
        locks
            .entry(local_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Items ────────────────────────────────────────────────────────────

    pub async fn get(&self, local_id: i64) -> Result<Option<InventoryItem>, VaultError> {
        let conn = self.conn.lock().await;
        let item = conn
            .query_row(
                "SELECT * FROM items WHERE local_id = ?1",
                params![local_id],
                item_from_row,
            )
            .optional()?;
        item.transpose().map_err(Into::into)
    }

    pub async fn get_by_remote(&self, remote_id: i64) -> Result<Option<InventoryItem>, VaultError> {
        let conn = self.conn.lock().await;
        let item = conn
            .query_row(
                "SELECT * FROM items WHERE remote_id = ?1",
                params![remote_id],
                item_from_row,
            )
            .optional()?;
        item.transpose().map_err(Into::into)
    }

    pub async fn list(&self, filter: Option<ItemStatus>) -> Result<Vec<InventoryItem>, VaultError> {
        let conn = self.conn.lock().await;
        let mut collected = Vec::new();
        match filter {
            Some(status) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM items WHERE status = ?1 ORDER BY local_id")?;
                let rows = stmt.query_map(params![status.as_str()], item_from_row)?;
                for row in rows {
                    collected.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM items ORDER BY local_id")?;
                let rows = stmt.query_map([], item_from_row)?;
                for row in rows {
                    collected.push(row??);
                }
            }
        }
        Ok(collected)
    }

    /// Merge `patch` into an existing record (by `local_id`) or create a new
    /// one. A `None` field never clears stored data; only explicit values
    /// overwrite, so a partial detail fetch cannot erase known fields.
    pub async fn upsert(&self, patch: ItemPatch) -> Result<InventoryItem, VaultError> {
        match patch.local_id {
            Some(local_id) => {
                let existing = self
                    .get(local_id)
                    .await?
                    .ok_or(VaultError::NotFound(local_id))?;
                let merged = merge_patch(existing, patch);
                self.write_item(&merged).await?;
                Ok(merged)
            }
            None => self.insert_item(patch).await,
        }
    }

    async fn insert_item(&self, patch: ItemPatch) -> Result<InventoryItem, VaultError> {
        let now = now_ts();
        let status = if patch.remote_id.is_some() {
            ItemStatus::Live
        } else {
            ItemStatus::LocalOnly
        };
        let color_ids = serde_json::to_string(&patch.color_ids.clone().unwrap_or_default())?;
        let attributes = serde_json::to_string(&patch.attributes.clone().unwrap_or_default())?;
        let images = serde_json::to_string(&patch.images.clone().unwrap_or_default())?;

        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO items (remote_id, status, title, description, price, currency,
                                category_id, brand_id, size_id, condition_id, package_size_id,
                                color_ids, attributes, images, relist_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, ?15, ?15)",
            params![
                patch.remote_id,
                status.as_str(),
                patch.title.clone().unwrap_or_default(),
                patch.description,
                patch.price,
                patch.currency,
                patch.category_id,
                patch.brand_id,
                patch.size_id,
                patch.condition_id,
                patch.package_size_id,
                color_ids,
                attributes,
                images,
                now,
            ],
        );
        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(VaultError::DuplicateRemote(patch.remote_id.unwrap_or(0)));
            }
            Err(err) => return Err(err.into()),
        }
        let local_id = conn.last_insert_rowid();
        let item = conn.query_row(
            "SELECT * FROM items WHERE local_id = ?1",
            params![local_id],
            item_from_row,
        )??;
        Ok(item)
    }

    async fn write_item(&self, item: &InventoryItem) -> Result<(), VaultError> {
        let color_ids = serde_json::to_string(&item.color_ids)?;
        let attributes = serde_json::to_string(&item.attributes)?;
        let images = serde_json::to_string(&item.images)?;
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE items SET remote_id = ?2, status = ?3, discrepancy_reason = ?4, title = ?5,
                    description = ?6, price = ?7, currency = ?8, category_id = ?9, brand_id = ?10,
                    size_id = ?11, condition_id = ?12, package_size_id = ?13, color_ids = ?14,
                    attributes = ?15, images = ?16, relist_count = ?17, detail_hydrated_at = ?18,
                    updated_at = ?19
             WHERE local_id = ?1",
            params![
                item.local_id,
                item.remote_id,
                item.status.as_str(),
                item.discrepancy_reason.map(|r| r.as_str()),
                item.title,
                item.description,
                item.price,
                item.currency,
                item.category_id,
                item.brand_id,
                item.size_id,
                item.condition_id,
                item.package_size_id,
                color_ids,
                attributes,
                images,
                item.relist_count,
                item.detail_hydrated_at,
                now_ts(),
            ],
        );
        match result {
            Ok(0) => Err(VaultError::NotFound(item.local_id)),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(VaultError::DuplicateRemote(item.remote_id.unwrap_or(0)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete an item. Rejected while an active queue entry references it;
    /// a leftover `error` entry is swept away with the item.
    pub async fn delete(&self, local_id: i64) -> Result<(), VaultError> {
        if self.has_active_entry(local_id).await? {
            return Err(VaultError::Conflict(format!(
                "item {local_id} has an active relist queue entry; dequeue it first"
            )));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM relist_queue WHERE local_id = ?1",
            params![local_id],
        )?;
        let affected = conn.execute("DELETE FROM items WHERE local_id = ?1", params![local_id])?;
        if affected == 0 {
            return Err(VaultError::NotFound(local_id));
        }
        Ok(())
    }

    pub async fn set_status(
        &self,
        local_id: i64,
        status: ItemStatus,
        reason: Option<DiscrepancyReason>,
    ) -> Result<(), VaultError> {
        // The reason column only carries meaning alongside `discrepancy`.
        let reason = if status == ItemStatus::Discrepancy {
            reason
        } else {
            None
        };
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE items SET status = ?2, discrepancy_reason = ?3, updated_at = ?4
             WHERE local_id = ?1",
            params![
                local_id,
                status.as_str(),
                reason.map(|r| r.as_str()),
                now_ts()
            ],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound(local_id));
        }
        Ok(())
    }

    pub async fn set_detail_hydrated(&self, local_id: i64, at: i64) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE items SET detail_hydrated_at = ?2, updated_at = ?3 WHERE local_id = ?1",
            params![local_id, at, now_ts()],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound(local_id));
        }
        Ok(())
    }

    /// Successful relist: the listing lives under a fresh remote id and the
    /// monotonic relist counter advances by one.
    pub async fn complete_relist(
        &self,
        local_id: i64,
        new_remote_id: i64,
    ) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE items SET remote_id = ?2, status = 'live', discrepancy_reason = NULL,
                    relist_count = relist_count + 1, updated_at = ?3
             WHERE local_id = ?1",
            params![local_id, new_remote_id, now_ts()],
        );
        match result {
            Ok(0) => Err(VaultError::NotFound(local_id)),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(VaultError::DuplicateRemote(new_remote_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn items_with_category_in(
        &self,
        removed: &HashSet<i64>,
    ) -> Result<Vec<InventoryItem>, VaultError> {
        let all = self.list(None).await?;
        Ok(all
            .into_iter()
            .filter(|item| item.category_id.is_some_and(|id| removed.contains(&id)))
            .collect())
    }

    // ── Relist queue ─────────────────────────────────────────────────────

    /// Insert a queue entry unless the item already has an active one.
    /// A terminal `error` row is replaced (re-enqueue goes to the back of
    /// the queue). Returns whether a new entry was created.
    pub async fn enqueue_entry(
        &self,
        local_id: i64,
        jittered_title: &str,
        relist_count: i64,
    ) -> Result<bool, VaultError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM relist_queue WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(raw) = existing {
            let status = QueueStatus::from_str(&raw)
                .ok_or_else(|| VaultError::Storage(format!("bad queue status `{raw}`")))?;
            if status.is_active() {
                return Ok(false);
            }
            conn.execute(
                "DELETE FROM relist_queue WHERE local_id = ?1",
                params![local_id],
            )?;
        }
        conn.execute(
            "INSERT INTO relist_queue (local_id, status, jittered_title, relist_count, enqueued_at)
             VALUES (?1, 'pending', ?2, ?3, ?4)",
            params![local_id, jittered_title, relist_count, now_ts()],
        )?;
        Ok(true)
    }

    pub async fn queue_entries(&self) -> Result<Vec<RelistQueueEntry>, VaultError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM relist_queue ORDER BY seq")?;
        let rows = stmt.query_map([], queue_entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }

    pub async fn oldest_pending(&self) -> Result<Option<RelistQueueEntry>, VaultError> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                "SELECT * FROM relist_queue WHERE status = 'pending' ORDER BY seq LIMIT 1",
                [],
                queue_entry_from_row,
            )
            .optional()?;
        entry.transpose().map_err(Into::into)
    }

    pub async fn queue_entry(&self, local_id: i64) -> Result<Option<RelistQueueEntry>, VaultError> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                "SELECT * FROM relist_queue WHERE local_id = ?1",
                params![local_id],
                queue_entry_from_row,
            )
            .optional()?;
        entry.transpose().map_err(Into::into)
    }

    pub async fn set_queue_status(
        &self,
        local_id: i64,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE relist_queue SET status = ?2, error = ?3 WHERE local_id = ?1",
            params![local_id, status.as_str(), error],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound(local_id));
        }
        Ok(())
    }

    pub async fn set_queue_mutation(
        &self,
        local_id: i64,
        jittered_title: &str,
        mutated_thumbnail: Option<&str>,
    ) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE relist_queue SET jittered_title = ?2, mutated_thumbnail = ?3
             WHERE local_id = ?1",
            params![local_id, jittered_title, mutated_thumbnail],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound(local_id));
        }
        Ok(())
    }

    pub async fn remove_queue_entry(&self, local_id: i64) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM relist_queue WHERE local_id = ?1",
            params![local_id],
        )?;
        Ok(())
    }

    /// User-initiated removal; only `pending` entries may be cancelled.
    pub async fn dequeue(&self, local_id: i64) -> Result<(), VaultError> {
        let conn = self.conn.lock().await;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM relist_queue WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => Err(VaultError::NotFound(local_id)),
            Some("pending") => {
                conn.execute(
                    "DELETE FROM relist_queue WHERE local_id = ?1",
                    params![local_id],
                )?;
                Ok(())
            }
            Some(other) => Err(VaultError::Conflict(format!(
                "queue entry for item {local_id} is `{other}`; only pending entries can be removed"
            ))),
        }
    }

    pub async fn clear_pending(&self) -> Result<usize, VaultError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM relist_queue WHERE status = 'pending'", [])?;
        Ok(removed)
    }

    pub async fn has_active_entry(&self, local_id: i64) -> Result<bool, VaultError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM relist_queue
             WHERE local_id = ?1 AND status IN ('pending', 'mutating', 'uploading')",
            params![local_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Startup pass: an entry caught mid-flight cannot be trusted to have
    /// completed exactly once, so it becomes `error` instead of re-running.
    pub async fn recover_interrupted(&self) -> Result<Vec<i64>, VaultError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT local_id FROM relist_queue WHERE status IN ('mutating', 'uploading')",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        if !ids.is_empty() {
            conn.execute(
                "UPDATE relist_queue
                 SET status = 'error', error = 'interrupted by restart; outcome unknown'
                 WHERE status IN ('mutating', 'uploading')",
                [],
            )?;
            info!(
                target = "vault.store",
                count = ids.len(),
                "reclassified interrupted relist entries as error"
            );
        }
        Ok(ids)
    }

    // ── Ontology mirror ──────────────────────────────────────────────────

    /// Atomically replace the mirror snapshot for one entity type.
    pub async fn replace_ontology(
        &self,
        kind: OntologyType,
        entities: &[OntologyEntity],
    ) -> Result<(), VaultError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM ontology WHERE entity_type = ?1",
            params![kind.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ontology (entity_type, entity_id, parent_id, name, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entity in entities {
                let extra = entity
                    .extra
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(VaultError::from)?;
                stmt.execute(params![
                    kind.as_str(),
                    entity.entity_id,
                    entity.parent_id,
                    entity.name,
                    extra,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO ontology_meta (entity_type, fetched_at) VALUES (?1, ?2)
             ON CONFLICT(entity_type) DO UPDATE SET fetched_at = excluded.fetched_at",
            params![kind.as_str(), now_ts()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn ontology_entities(
        &self,
        kind: OntologyType,
    ) -> Result<Vec<OntologyEntity>, VaultError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT entity_id, parent_id, name, extra FROM ontology
             WHERE entity_type = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], move |row| {
            entity_from_row(row, kind)
        })?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row??);
        }
        Ok(entities)
    }

    pub async fn ontology_entity(
        &self,
        kind: OntologyType,
        entity_id: i64,
    ) -> Result<Option<OntologyEntity>, VaultError> {
        let conn = self.conn.lock().await;
        let entity = conn
            .query_row(
                "SELECT entity_id, parent_id, name, extra FROM ontology
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![kind.as_str(), entity_id],
                move |row| entity_from_row(row, kind),
            )
            .optional()?;
        entity.transpose().map_err(Into::into)
    }

    pub async fn ontology_ids(&self, kind: OntologyType) -> Result<HashSet<i64>, VaultError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT entity_id FROM ontology WHERE entity_type = ?1")?;
        let ids = stmt
            .query_map(params![kind.as_str()], |row| row.get(0))?
            .collect::<Result<HashSet<i64>, _>>()?;
        Ok(ids)
    }

    pub async fn ontology_child_count(
        &self,
        kind: OntologyType,
        entity_id: i64,
    ) -> Result<i64, VaultError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ontology WHERE entity_type = ?1 AND parent_id = ?2",
            params![kind.as_str(), entity_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn ontology_fetched_at(&self, kind: OntologyType) -> Result<Option<i64>, VaultError> {
        let conn = self.conn.lock().await;
        let fetched = conn
            .query_row(
                "SELECT fetched_at FROM ontology_meta WHERE entity_type = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fetched)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn merge_patch(mut item: InventoryItem, patch: ItemPatch) -> InventoryItem {
    if let Some(remote_id) = patch.remote_id {
        item.remote_id = Some(remote_id);
    }
    if let Some(title) = patch.title {
        item.title = title;
    }
    if let Some(description) = patch.description {
        item.description = Some(description);
    }
    if let Some(price) = patch.price {
        item.price = Some(price);
    }
    if let Some(currency) = patch.currency {
        item.currency = Some(currency);
    }
    if let Some(category_id) = patch.category_id {
        item.category_id = Some(category_id);
    }
    if let Some(brand_id) = patch.brand_id {
        item.brand_id = Some(brand_id);
    }
    if let Some(size_id) = patch.size_id {
        item.size_id = Some(size_id);
    }
    if let Some(condition_id) = patch.condition_id {
        item.condition_id = Some(condition_id);
    }
    if let Some(package_size_id) = patch.package_size_id {
        item.package_size_id = Some(package_size_id);
    }
    if let Some(color_ids) = patch.color_ids {
        item.color_ids = color_ids;
    }
    if let Some(attributes) = patch.attributes {
        item.attributes = attributes;
    }
    if let Some(images) = patch.images {
        item.images = images;
    }
    item
}

type RowResult<T> = Result<Result<T, VaultError>, rusqlite::Error>;

fn item_from_row(row: &rusqlite::Row<'_>) -> RowResult<InventoryItem> {
    let status_raw: String = row.get("status")?;
    let reason_raw: Option<String> = row.get("discrepancy_reason")?;
    let color_ids_raw: String = row.get("color_ids")?;
    let attributes_raw: String = row.get("attributes")?;
    let images_raw: String = row.get("images")?;

    Ok((|| {
        let status = ItemStatus::from_str(&status_raw)
            .ok_or_else(|| VaultError::Storage(format!("bad item status `{status_raw}`")))?;
        let discrepancy_reason = match reason_raw {
            Some(raw) => Some(
                DiscrepancyReason::from_str(&raw)
                    .ok_or_else(|| VaultError::Storage(format!("bad discrepancy reason `{raw}`")))?,
            ),
            None => None,
        };
        let color_ids: Vec<i64> = serde_json::from_str(&color_ids_raw)?;
        let attributes: Vec<ItemAttribute> = serde_json::from_str(&attributes_raw)?;
        let images: Vec<ImageRef> = serde_json::from_str(&images_raw)?;
        Ok(InventoryItem {
            local_id: row.get("local_id").map_err(VaultError::from)?,
            remote_id: row.get("remote_id").map_err(VaultError::from)?,
            status,
            discrepancy_reason,
            title: row.get("title").map_err(VaultError::from)?,
            description: row.get("description").map_err(VaultError::from)?,
            price: row.get("price").map_err(VaultError::from)?,
            currency: row.get("currency").map_err(VaultError::from)?,
            category_id: row.get("category_id").map_err(VaultError::from)?,
            brand_id: row.get("brand_id").map_err(VaultError::from)?,
            size_id: row.get("size_id").map_err(VaultError::from)?,
            condition_id: row.get("condition_id").map_err(VaultError::from)?,
            package_size_id: row.get("package_size_id").map_err(VaultError::from)?,
            color_ids,
            attributes,
            images,
            relist_count: row.get("relist_count").map_err(VaultError::from)?,
            detail_hydrated_at: row.get("detail_hydrated_at").map_err(VaultError::from)?,
            created_at: row.get("created_at").map_err(VaultError::from)?,
            updated_at: row.get("updated_at").map_err(VaultError::from)?,
        })
    })())
}

fn queue_entry_from_row(row: &rusqlite::Row<'_>) -> RowResult<RelistQueueEntry> {
    let status_raw: String = row.get("status")?;
    Ok((|| {
        let status = QueueStatus::from_str(&status_raw)
            .ok_or_else(|| VaultError::Storage(format!("bad queue status `{status_raw}`")))?;
        Ok(RelistQueueEntry {
            local_id: row.get("local_id").map_err(VaultError::from)?,
            status,
            error: row.get("error").map_err(VaultError::from)?,
            jittered_title: row.get("jittered_title").map_err(VaultError::from)?,
            mutated_thumbnail: row.get("mutated_thumbnail").map_err(VaultError::from)?,
            relist_count: row.get("relist_count").map_err(VaultError::from)?,
            enqueued_at: row.get("enqueued_at").map_err(VaultError::from)?,
        })
    })())
}

fn entity_from_row(row: &rusqlite::Row<'_>, kind: OntologyType) -> RowResult<OntologyEntity> {
    let extra_raw: Option<String> = row.get("extra")?;
    Ok((|| {
        let extra = extra_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        Ok(OntologyEntity {
            entity_id: row.get("entity_id").map_err(VaultError::from)?,
            entity_type: kind,
            parent_id: row.get("parent_id").map_err(VaultError::from)?,
            name: row.get("name").map_err(VaultError::from)?,
            extra,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemPatch;

    fn patch_with_title(title: &str) -> ItemPatch {
        ItemPatch {
            title: Some(title.to_string()),
            ..ItemPatch::default()
        }
    }

    #[tokio::test]
    async fn insert_defaults_to_local_only() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault.upsert(patch_with_title("Denim jacket")).await.unwrap();
        assert_eq!(item.status, ItemStatus::LocalOnly);
        assert!(item.remote_id.is_none());
        assert_eq!(item.relist_count, 0);
    }

    #[tokio::test]
    async fn upsert_merges_without_clearing_omitted_fields() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault
            .upsert(ItemPatch {
                title: Some("Silk scarf".into()),
                price: Some(12.0),
                description: Some("barely worn".into()),
                ..ItemPatch::default()
            })
            .await
            .unwrap();

        let updated = vault
            .upsert(ItemPatch {
                local_id: Some(item.local_id),
                price: Some(15.5),
                ..ItemPatch::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.title, "Silk scarf");
        assert_eq!(updated.price, Some(15.5));
        assert_eq!(updated.description.as_deref(), Some("barely worn"));
    }

    #[tokio::test]
    async fn explicit_empty_value_overwrites() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault
            .upsert(ItemPatch {
                title: Some("Boots".into()),
                color_ids: Some(vec![1, 2]),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        let updated = vault
            .upsert(ItemPatch {
                local_id: Some(item.local_id),
                color_ids: Some(vec![]),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        assert!(updated.color_ids.is_empty());
    }

    #[tokio::test]
    async fn duplicate_remote_id_is_rejected() {
        let vault = Vault::open_in_memory().unwrap();
        vault
            .upsert(ItemPatch {
                title: Some("first".into()),
                remote_id: Some(42),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        let err = vault
            .upsert(ItemPatch {
                title: Some("second".into()),
                remote_id: Some(42),
                ..ItemPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::DuplicateRemote(42)));
    }

    #[tokio::test]
    async fn delete_with_active_queue_entry_conflicts() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault.upsert(patch_with_title("Cap")).await.unwrap();
        vault.enqueue_entry(item.local_id, "Cap", 0).await.unwrap();
        let err = vault.delete(item.local_id).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));

        vault.dequeue(item.local_id).await.unwrap();
        vault.delete(item.local_id).await.unwrap();
        assert!(vault.get(item.local_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_noop_and_error_entry_is_replaced() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault.upsert(patch_with_title("Tee")).await.unwrap();
        assert!(vault.enqueue_entry(item.local_id, "Tee", 0).await.unwrap());
        assert!(!vault.enqueue_entry(item.local_id, "Tee", 0).await.unwrap());

        vault
            .set_queue_status(item.local_id, QueueStatus::Error, Some("boom"))
            .await
            .unwrap();
        assert!(vault.enqueue_entry(item.local_id, "Tee", 0).await.unwrap());
        let entry = vault.queue_entry(item.local_id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn dequeue_rejects_non_pending() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault.upsert(patch_with_title("Bag")).await.unwrap();
        vault.enqueue_entry(item.local_id, "Bag", 0).await.unwrap();
        vault
            .set_queue_status(item.local_id, QueueStatus::Uploading, None)
            .await
            .unwrap();
        let err = vault.dequeue(item.local_id).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let vault = Vault::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for n in 0..3 {
            let item = vault
                .upsert(patch_with_title(&format!("item-{n}")))
                .await
                .unwrap();
            vault
                .enqueue_entry(item.local_id, &item.title, 0)
                .await
                .unwrap();
            ids.push(item.local_id);
        }
        let entries = vault.queue_entries().await.unwrap();
        let order: Vec<i64> = entries.iter().map(|e| e.local_id).collect();
        assert_eq!(order, ids);
        assert_eq!(
            vault.oldest_pending().await.unwrap().unwrap().local_id,
            ids[0]
        );
    }

    #[tokio::test]
    async fn recover_marks_in_flight_entries_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        {
            let vault = Vault::open(&path).unwrap();
            let item = vault.upsert(patch_with_title("Coat")).await.unwrap();
            vault.enqueue_entry(item.local_id, "Coat", 0).await.unwrap();
            vault
                .set_queue_status(item.local_id, QueueStatus::Uploading, None)
                .await
                .unwrap();
        }
        let vault = Vault::open(&path).unwrap();
        let recovered = vault.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        let entries = vault.queue_entries().await.unwrap();
        assert_eq!(entries[0].status, QueueStatus::Error);
        assert!(entries[0].error.as_deref().unwrap().contains("restart"));
    }

    #[tokio::test]
    async fn complete_relist_increments_counter_and_relinks() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault
            .upsert(ItemPatch {
                title: Some("Hat".into()),
                remote_id: Some(7),
                ..ItemPatch::default()
            })
            .await
            .unwrap();
        vault.complete_relist(item.local_id, 8).await.unwrap();
        let stored = vault.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.remote_id, Some(8));
        assert_eq!(stored.relist_count, 1);
        assert_eq!(stored.status, ItemStatus::Live);
    }

    #[tokio::test]
    async fn ontology_replace_is_versioned_per_type() {
        let vault = Vault::open_in_memory().unwrap();
        let cats = vec![
            OntologyEntity {
                entity_id: 1,
                entity_type: OntologyType::Category,
                parent_id: None,
                name: "Women".into(),
                extra: None,
            },
            OntologyEntity {
                entity_id: 2,
                entity_type: OntologyType::Category,
                parent_id: Some(1),
                name: "Coats".into(),
                extra: None,
            },
        ];
        vault
            .replace_ontology(OntologyType::Category, &cats)
            .await
            .unwrap();
        assert!(vault
            .ontology_fetched_at(OntologyType::Category)
            .await
            .unwrap()
            .is_some());
        assert!(vault
            .ontology_fetched_at(OntologyType::Color)
            .await
            .unwrap()
            .is_none());

        let replacement = vec![cats[0].clone()];
        vault
            .replace_ontology(OntologyType::Category, &replacement)
            .await
            .unwrap();
        let ids = vault.ontology_ids(OntologyType::Category).await.unwrap();
        assert!(ids.contains(&1));
        assert!(!ids.contains(&2));
    }

    #[tokio::test]
    async fn set_status_drops_reason_outside_discrepancy() {
        let vault = Vault::open_in_memory().unwrap();
        let item = vault.upsert(patch_with_title("Belt")).await.unwrap();
        vault
            .set_status(
                item.local_id,
                ItemStatus::Discrepancy,
                Some(DiscrepancyReason::ExternalChange),
            )
            .await
            .unwrap();
        let stored = vault.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(
            stored.discrepancy_reason,
            Some(DiscrepancyReason::ExternalChange)
        );

        vault
            .set_status(item.local_id, ItemStatus::Live, None)
            .await
            .unwrap();
        let stored = vault.get(item.local_id).await.unwrap().unwrap();
        assert!(stored.discrepancy_reason.is_none());
    }
}
