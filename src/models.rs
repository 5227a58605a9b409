use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Lifecycle of a vault item. `LocalOnly` items have no remote listing yet;
/// every other status requires a linked `remote_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    LocalOnly,
    Live,
    Hidden,
    Reserved,
    Sold,
    Discrepancy,
    ActionRequired,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::LocalOnly => "local_only",
            ItemStatus::Live => "live",
            ItemStatus::Hidden => "hidden",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Sold => "sold",
            ItemStatus::Discrepancy => "discrepancy",
            ItemStatus::ActionRequired => "action_required",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "local_only" => Some(ItemStatus::LocalOnly),
            "live" => Some(ItemStatus::Live),
            "hidden" => Some(ItemStatus::Hidden),
            "reserved" => Some(ItemStatus::Reserved),
            "sold" => Some(ItemStatus::Sold),
            "discrepancy" => Some(ItemStatus::Discrepancy),
            "action_required" => Some(ItemStatus::ActionRequired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyReason {
    FailedPush,
    ExternalChange,
}

impl DiscrepancyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyReason::FailedPush => "failed_push",
            DiscrepancyReason::ExternalChange => "external_change",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "failed_push" => Some(DiscrepancyReason::FailedPush),
            "external_change" => Some(DiscrepancyReason::ExternalChange),
            _ => None,
        }
    }
}

/// An image slot on an item: either already hosted on the platform CDN or a
/// file in the local photo cache awaiting upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    Remote { url: String },
    Local { path: String },
}

/// One entry of the open-ended attribute list. The remote taxonomy defines
/// which codes exist per category, so the schema stays `{code, ids[]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemAttribute {
    pub code: String,
    pub ids: Vec<i64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub local_id: i64,
    pub remote_id: Option<i64>,
    pub status: ItemStatus,
    pub discrepancy_reason: Option<DiscrepancyReason>,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub category_id: Option<i64>,
    pub brand_id: Option<i64>,
    pub size_id: Option<i64>,
    pub condition_id: Option<i64>,
    pub package_size_id: Option<i64>,
    #[serde(default)]
    pub color_ids: Vec<i64>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    pub relist_count: i64,
    pub detail_hydrated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial item for `upsert`: a `None` field is "not mentioned" and never
/// clears stored data; a `Some` value (including an explicit empty string or
/// empty list) overwrites.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ItemPatch {
    #[serde(default)]
    pub local_id: Option<i64>,
    #[serde(default)]
    pub remote_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub brand_id: Option<i64>,
    #[serde(default)]
    pub size_id: Option<i64>,
    #[serde(default)]
    pub condition_id: Option<i64>,
    #[serde(default)]
    pub package_size_id: Option<i64>,
    #[serde(default)]
    pub color_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub attributes: Option<Vec<ItemAttribute>>,
    #[serde(default)]
    pub images: Option<Vec<ImageRef>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Mutating,
    Uploading,
    Done,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Mutating => "mutating",
            QueueStatus::Uploading => "uploading",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(QueueStatus::Pending),
            "mutating" => Some(QueueStatus::Mutating),
            "uploading" => Some(QueueStatus::Uploading),
            "done" => Some(QueueStatus::Done),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }

    /// Pending, mutating and uploading entries block a second enqueue and a
    /// vault delete; done entries are removed and error entries may be
    /// replaced by a fresh enqueue.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Mutating | QueueStatus::Uploading
        )
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelistQueueEntry {
    pub local_id: i64,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub jittered_title: String,
    /// Base64 JPEG preview of the mutated first photo, when one was produced.
    pub mutated_thumbnail: Option<String>,
    /// Relist count snapshotted at enqueue time; drives mutation direction.
    pub relist_count: i64,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OntologyType {
    Category,
    Brand,
    Color,
    Condition,
    Size,
    Material,
    PackageSize,
}

impl OntologyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OntologyType::Category => "category",
            OntologyType::Brand => "brand",
            OntologyType::Color => "color",
            OntologyType::Condition => "condition",
            OntologyType::Size => "size",
            OntologyType::Material => "material",
            OntologyType::PackageSize => "package_size",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "category" => Some(OntologyType::Category),
            "brand" => Some(OntologyType::Brand),
            "color" => Some(OntologyType::Color),
            "condition" => Some(OntologyType::Condition),
            "size" => Some(OntologyType::Size),
            "material" => Some(OntologyType::Material),
            "package_size" => Some(OntologyType::PackageSize),
            _ => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OntologyEntity {
    pub entity_id: i64,
    pub entity_type: OntologyType,
    pub parent_id: Option<i64>,
    pub name: String,
    /// Type-specific payload (color hex, size group label, ...).
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OntologyAlert {
    pub deleted_categories: Vec<i64>,
    pub affected_items: Vec<AffectedItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectedItem {
    pub local_id: i64,
    pub title: String,
    pub old_category: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ItemStatus::LocalOnly,
            ItemStatus::Live,
            ItemStatus::Hidden,
            ItemStatus::Reserved,
            ItemStatus::Sold,
            ItemStatus::Discrepancy,
            ItemStatus::ActionRequired,
        ] {
            assert_eq!(ItemStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::from_str("draft"), None);
    }

    #[test]
    fn queue_activity_split() {
        assert!(QueueStatus::Pending.is_active());
        assert!(QueueStatus::Mutating.is_active());
        assert!(QueueStatus::Uploading.is_active());
        assert!(!QueueStatus::Done.is_active());
        assert!(!QueueStatus::Error.is_active());
    }

    #[test]
    fn patch_with_omitted_fields_deserializes_to_none() {
        let patch: ItemPatch = serde_json::from_str(r#"{"title": "Wool coat"}"#).unwrap();
        assert_eq!(patch.title.as_deref(), Some("Wool coat"));
        assert!(patch.price.is_none());
        assert!(patch.color_ids.is_none());
    }

    #[test]
    fn patch_with_explicit_empty_list_is_some() {
        let patch: ItemPatch = serde_json::from_str(r#"{"color_ids": []}"#).unwrap();
        assert_eq!(patch.color_ids, Some(vec![]));
    }
}
