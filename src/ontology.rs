use crate::events::{BridgeEvent, EventBus};
use crate::models::{
    AffectedItem, ItemStatus, OntologyAlert, OntologyEntity, OntologyType,
};
use crate::vault::{Vault, VaultError};
use crate::vinted::{GatewayError, MarketplaceGateway};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

// Category chains are shallow (4-5 levels); anything past this is a broken
// parent link.
const MAX_CHAIN_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum OntologyError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("category {0} not found in mirror")]
    UnknownCategory(i64),
    #[error("category {0} is not a leaf")]
    NotLeaf(i64),
    #[error("category chain for {0} does not terminate")]
    BrokenChain(i64),
}

/// Refreshes the taxonomy mirror and flags items whose stored category
/// vanished from the tree.
pub struct OntologyEngine {
    vault: Arc<Vault>,
    gateway: Arc<dyn MarketplaceGateway>,
    events: EventBus,
}

impl OntologyEngine {
    pub fn new(vault: Arc<Vault>, gateway: Arc<dyn MarketplaceGateway>, events: EventBus) -> Self {
        Self {
            vault,
            gateway,
            events,
        }
    }

    /// Fetch the current taxonomy for one entity type and replace the mirror
    /// snapshot atomically. For categories, every mirror id that disappeared
    /// marks its items `action_required` and lands in the returned alert;
    /// a refresh that removes nothing returns `None`.
    pub async fn refresh(
        &self,
        kind: OntologyType,
    ) -> Result<Option<OntologyAlert>, OntologyError> {
        let fresh = self.gateway.fetch_taxonomy(kind).await?;
        info!(
            target = "vault.ontology",
            kind = kind.as_str(),
            count = fresh.len(),
            "taxonomy fetched"
        );

        if kind != OntologyType::Category {
            self.vault.replace_ontology(kind, &fresh).await?;
            return Ok(None);
        }

        // Pre-refresh mirror state, needed both for the removed-id diff and
        // to resolve `old_category` labels after the snapshot is replaced.
        let previous = self.vault.ontology_entities(OntologyType::Category).await?;
        let old_ids: HashSet<i64> = previous.iter().map(|e| e.entity_id).collect();
        let new_ids: HashSet<i64> = fresh.iter().map(|e| e.entity_id).collect();

        self.vault.replace_ontology(kind, &fresh).await?;

        // An empty previous mirror means first population, not a mass
        // removal.
        if old_ids.is_empty() {
            return Ok(None);
        }
        let removed: HashSet<i64> = old_ids.difference(&new_ids).copied().collect();
        if removed.is_empty() {
            return Ok(None);
        }

        let names: HashMap<i64, String> = previous
            .into_iter()
            .map(|e| (e.entity_id, e.name))
            .collect();

        let mut affected_items = Vec::new();
        for item in self.vault.items_with_category_in(&removed).await? {
            self.vault
                .set_status(item.local_id, ItemStatus::ActionRequired, None)
                .await?;
            let old_category = item
                .category_id
                .and_then(|id| names.get(&id).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            affected_items.push(AffectedItem {
                local_id: item.local_id,
                title: item.title,
                old_category,
            });
        }

        let mut deleted_categories: Vec<i64> = removed.into_iter().collect();
        deleted_categories.sort_unstable();
        warn!(
            target = "vault.ontology",
            removed = deleted_categories.len(),
            affected = affected_items.len(),
            "categories removed upstream"
        );
        let alert = OntologyAlert {
            deleted_categories,
            affected_items,
        };
        self.events.publish(BridgeEvent::OntologyAlert {
            alert: alert.clone(),
        });
        Ok(Some(alert))
    }

    pub async fn entities(&self, kind: OntologyType) -> Result<Vec<OntologyEntity>, OntologyError> {
        Ok(self.vault.ontology_entities(kind).await?)
    }

    /// Root-to-leaf category chain for cascading pickers. Fails on an id
    /// missing from the mirror or a parent link that never reaches a root.
    pub async fn category_chain(&self, leaf_id: i64) -> Result<Vec<OntologyEntity>, OntologyError> {
        let mut chain = Vec::new();
        let mut current = leaf_id;
        for _ in 0..MAX_CHAIN_DEPTH {
            let entity = self
                .vault
                .ontology_entity(OntologyType::Category, current)
                .await?
                .ok_or(OntologyError::UnknownCategory(current))?;
            let parent = entity.parent_id;
            chain.push(entity);
            match parent {
                Some(parent_id) => current = parent_id,
                None => {
                    chain.reverse();
                    return Ok(chain);
                }
            }
        }
        Err(OntologyError::BrokenChain(leaf_id))
    }

    /// A category is final only when it exists and has no children.
    pub async fn validate_leaf(&self, category_id: i64) -> Result<(), OntologyError> {
        let entity = self
            .vault
            .ontology_entity(OntologyType::Category, category_id)
            .await?;
        if entity.is_none() {
            return Err(OntologyError::UnknownCategory(category_id));
        }
        let children = self
            .vault
            .ontology_child_count(OntologyType::Category, category_id)
            .await?;
        if children > 0 {
            return Err(OntologyError::NotLeaf(category_id));
        }
        Ok(())
    }

    /// Advisory reverse lookup from scraped display text to a taxonomy id.
    /// Case-insensitive exact match only; localized or renamed entries will
    /// miss, and callers must treat `None` as "save without the id".
    pub async fn reverse_lookup(
        &self,
        kind: OntologyType,
        text: &str,
    ) -> Result<Option<i64>, OntologyError> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let entities = self.vault.ontology_entities(kind).await?;
        Ok(entities
            .iter()
            .find(|e| e.name.trim().to_lowercase() == needle)
            .map(|e| e.entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemPatch;
    use crate::vinted::{
        GatewayError, ListingDraft, MarketplaceGateway, RelistOutcome, RemoteItemDetail,
        RemoteListing,
    };
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Gateway fake that serves a queued taxonomy snapshot per refresh call.
    struct TaxonomyFake {
        snapshots: Mutex<Vec<Vec<OntologyEntity>>>,
    }

    impl TaxonomyFake {
        fn new(snapshots: Vec<Vec<OntologyEntity>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots),
            }
        }
    }

    #[async_trait]
    impl MarketplaceGateway for TaxonomyFake {
        async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn fetch_item_detail(&self, _: i64) -> Result<RemoteItemDetail, GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn create_listing(&self, _: &ListingDraft) -> Result<i64, GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn update_listing(&self, _: i64, _: &ListingDraft) -> Result<(), GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn delete_listing(&self, _: i64) -> Result<(), GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn fetch_image(&self, _: &str) -> Result<Vec<u8>, GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn relist_listing(
            &self,
            _: i64,
            _: &ListingDraft,
            _: Vec<Vec<u8>>,
            _: i64,
        ) -> Result<RelistOutcome, GatewayError> {
            unimplemented!("not used in ontology tests")
        }
        async fn fetch_taxonomy(
            &self,
            _: OntologyType,
        ) -> Result<Vec<OntologyEntity>, GatewayError> {
            let mut snapshots = self.snapshots.lock().await;
            if snapshots.is_empty() {
                return Err(GatewayError::Request("no snapshot queued".into()));
            }
            Ok(snapshots.remove(0))
        }
    }

    fn category(id: i64, parent: Option<i64>, name: &str) -> OntologyEntity {
        OntologyEntity {
            entity_id: id,
            entity_type: OntologyType::Category,
            parent_id: parent,
            name: name.to_string(),
            extra: None,
        }
    }

    fn engine_with(snapshots: Vec<Vec<OntologyEntity>>) -> (OntologyEngine, Arc<Vault>, EventBus) {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let events = EventBus::new();
        let engine = OntologyEngine::new(
            vault.clone(),
            Arc::new(TaxonomyFake::new(snapshots)),
            events.clone(),
        );
        (engine, vault, events)
    }

    #[tokio::test]
    async fn first_refresh_populates_without_alert() {
        let (engine, vault, _events) =
            engine_with(vec![vec![category(1, None, "Women"), category(900, Some(1), "Cravats")]]);
        let alert = engine.refresh(OntologyType::Category).await.unwrap();
        assert!(alert.is_none());
        assert_eq!(
            vault.ontology_ids(OntologyType::Category).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn removed_category_flags_items_and_alerts() {
        let (engine, vault, events) = engine_with(vec![
            vec![category(1, None, "Women"), category(900, Some(1), "Cravats")],
            vec![category(1, None, "Women")],
        ]);
        engine.refresh(OntologyType::Category).await.unwrap();

        let item = vault
            .upsert(ItemPatch {
                title: Some("Paisley cravat".into()),
                category_id: Some(900),
                ..ItemPatch::default()
            })
            .await
            .unwrap();

        let mut rx = events.subscribe();
        let alert = engine
            .refresh(OntologyType::Category)
            .await
            .unwrap()
            .expect("alert");
        assert_eq!(alert.deleted_categories, vec![900]);
        assert_eq!(alert.affected_items.len(), 1);
        assert_eq!(alert.affected_items[0].local_id, item.local_id);
        assert_eq!(alert.affected_items[0].old_category, "Cravats");

        let stored = vault.get(item.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::ActionRequired);
        assert!(matches!(
            rx.recv().await.unwrap(),
            BridgeEvent::OntologyAlert { .. }
        ));
    }

    #[tokio::test]
    async fn refresh_without_removals_emits_nothing() {
        let snapshot = vec![category(1, None, "Women")];
        let (engine, _vault, _events) = engine_with(vec![snapshot.clone(), snapshot]);
        engine.refresh(OntologyType::Category).await.unwrap();
        let alert = engine.refresh(OntologyType::Category).await.unwrap();
        assert!(alert.is_none());
    }

    #[tokio::test]
    async fn chain_resolves_root_to_leaf() {
        let (engine, _vault, _events) = engine_with(vec![vec![
            category(1, None, "Women"),
            category(10, Some(1), "Outerwear"),
            category(100, Some(10), "Coats"),
        ]]);
        engine.refresh(OntologyType::Category).await.unwrap();

        let chain = engine.category_chain(100).await.unwrap();
        let names: Vec<&str> = chain.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Women", "Outerwear", "Coats"]);

        engine.validate_leaf(100).await.unwrap();
        assert!(matches!(
            engine.validate_leaf(10).await.unwrap_err(),
            OntologyError::NotLeaf(10)
        ));
        assert!(matches!(
            engine.validate_leaf(999).await.unwrap_err(),
            OntologyError::UnknownCategory(999)
        ));
    }

    #[tokio::test]
    async fn cyclic_parent_links_are_detected() {
        let (engine, vault, _events) = engine_with(vec![]);
        vault
            .replace_ontology(
                OntologyType::Category,
                &[category(1, Some(2), "A"), category(2, Some(1), "B")],
            )
            .await
            .unwrap();
        assert!(matches!(
            engine.category_chain(1).await.unwrap_err(),
            OntologyError::BrokenChain(1)
        ));
    }

    #[tokio::test]
    async fn reverse_lookup_is_case_insensitive_and_advisory() {
        let (engine, vault, _events) = engine_with(vec![]);
        vault
            .replace_ontology(OntologyType::Category, &[category(5, None, "Knitwear")])
            .await
            .unwrap();
        assert_eq!(
            engine
                .reverse_lookup(OntologyType::Category, "  kNiTwEaR ")
                .await
                .unwrap(),
            Some(5)
        );
        assert_eq!(
            engine
                .reverse_lookup(OntologyType::Category, "Maille")
                .await
                .unwrap(),
            None
        );
    }
}
