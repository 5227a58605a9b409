//! Normalization of duck-typed platform payloads.
//!
//! The platform delivers the same listing in several shapes depending on the
//! route: prices arrive as numbers, strings or `{amount, currency_code}`
//! objects; brand/size/condition arrive as bare ids, display strings or
//! nested objects; colors arrive as an id list, an object list or a
//! `color1`/`color2` pair. Everything ambiguous is resolved here, once, into
//! the canonical structs from the parent module. The core never sees a raw
//! payload.

use crate::models::ItemAttribute;
use crate::vinted::{GatewayError, RemoteItemDetail, RemoteLifecycle, RemoteListing};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriceField {
    Number(f64),
    Text(String),
    Object {
        #[serde(default)]
        amount: Option<AmountField>,
        #[serde(default)]
        currency_code: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Number(f64),
    Text(String),
}

impl AmountField {
    fn resolve(&self) -> Option<f64> {
        match self {
            AmountField::Number(value) => Some(*value),
            AmountField::Text(value) => value.trim().parse().ok(),
        }
    }
}

impl PriceField {
    pub fn amount(&self) -> Option<f64> {
        match self {
            PriceField::Number(value) => Some(*value),
            PriceField::Text(value) => value.trim().parse().ok(),
            PriceField::Object { amount, .. } => amount.as_ref().and_then(AmountField::resolve),
        }
    }

    pub fn currency(&self) -> Option<String> {
        match self {
            PriceField::Object { currency_code, .. } => currency_code.clone(),
            _ => None,
        }
    }
}

/// A reference that may be a bare id, a display string or a nested object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(i64),
    Text(String),
    Object {
        #[serde(default)]
        id: Option<i64>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl EntityRef {
    pub fn id(&self) -> Option<i64> {
        match self {
            EntityRef::Id(id) => Some(*id),
            EntityRef::Text(_) => None,
            EntityRef::Object { id, .. } => *id,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            EntityRef::Id(_) => None,
            EntityRef::Text(text) => Some(text),
            EntityRef::Object { title, name, .. } => title.as_deref().or(name.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColorsField {
    Ids(Vec<i64>),
    Objects(Vec<EntityRef>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PhotoField {
    Url(String),
    Object {
        #[serde(default)]
        url: Option<String>,
    },
}

impl PhotoField {
    fn url(&self) -> Option<&str> {
        match self {
            PhotoField::Url(url) => Some(url),
            PhotoField::Object { url } => url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttribute {
    pub code: String,
    #[serde(default, alias = "value")]
    pub ids: Vec<i64>,
}

/// Every shape a full item payload has been observed in, SSR and API alike.
/// Field-level aliases cover camelCase twins; nested fallbacks are resolved
/// in `canonicalize`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawItemDetail {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<PriceField>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "catalogId")]
    pub catalog_id: Option<i64>,
    #[serde(default, alias = "categoryId")]
    pub category_id: Option<i64>,
    #[serde(default, alias = "catalogue")]
    pub catalog: Option<EntityRef>,
    #[serde(default)]
    pub category: Option<EntityRef>,
    #[serde(default, alias = "brandId")]
    pub brand_id: Option<i64>,
    #[serde(default)]
    pub brand_dto: Option<EntityRef>,
    #[serde(default)]
    pub brand: Option<EntityRef>,
    #[serde(default, alias = "sizeId")]
    pub size_id: Option<i64>,
    #[serde(default)]
    pub size: Option<EntityRef>,
    #[serde(default, alias = "statusId")]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub status: Option<EntityRef>,
    #[serde(default, alias = "packageSizeId")]
    pub package_size_id: Option<i64>,
    #[serde(default)]
    pub package_size: Option<EntityRef>,
    #[serde(default, alias = "colorIds")]
    pub color_ids: Option<ColorsField>,
    #[serde(default)]
    pub colors: Option<ColorsField>,
    #[serde(default, alias = "color1Id")]
    pub color1_id: Option<i64>,
    #[serde(default, alias = "color2Id")]
    pub color2_id: Option<i64>,
    #[serde(default, alias = "itemAttributes", alias = "attributes")]
    pub item_attributes: Vec<RawAttribute>,
    #[serde(default)]
    pub photos: Vec<PhotoField>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(default)]
    pub is_reserved: bool,
}

/// Condition display labels as they appear in SSR payloads, mapped to the
/// platform's numeric ids.
pub fn condition_id_from_label(label: &str) -> Option<i64> {
    match label.trim().to_lowercase().replace(' ', "_").as_str() {
        "new_with_tags" => Some(6),
        "new_without_tags" => Some(1),
        "very_good" => Some(2),
        "good" => Some(3),
        "satisfactory" => Some(4),
        "not_fully_functional" => Some(5),
        _ => None,
    }
}

pub fn lifecycle_from_flags(hidden: bool, reserved: bool, closed: bool) -> RemoteLifecycle {
    if closed {
        RemoteLifecycle::Sold
    } else if reserved {
        RemoteLifecycle::Reserved
    } else if hidden {
        RemoteLifecycle::Hidden
    } else {
        RemoteLifecycle::Live
    }
}

impl RawItemDetail {
    pub fn canonicalize(self) -> RemoteItemDetail {
        let category_id = self
            .catalog_id
            .or(self.category_id)
            .or_else(|| self.category.as_ref().and_then(EntityRef::id))
            .or_else(|| self.catalog.as_ref().and_then(EntityRef::id));

        let brand_id = self
            .brand_id
            .or_else(|| self.brand_dto.as_ref().and_then(EntityRef::id))
            .or_else(|| self.brand.as_ref().and_then(EntityRef::id));

        let size_id = self
            .size_id
            .or_else(|| self.size.as_ref().and_then(EntityRef::id));

        let condition_id = self
            .status_id
            .or_else(|| self.status.as_ref().and_then(EntityRef::id))
            .or_else(|| {
                self.status
                    .as_ref()
                    .and_then(EntityRef::label)
                    .and_then(condition_id_from_label)
            });

        let package_size_id = self
            .package_size_id
            .or_else(|| self.package_size.as_ref().and_then(EntityRef::id));

        let color_ids = resolve_colors(
            self.color_ids.or(self.colors),
            self.color1_id,
            self.color2_id,
        );

        let price = self.price.as_ref().and_then(PriceField::amount);
        let currency = self
            .price
            .as_ref()
            .and_then(PriceField::currency)
            .or(self.currency);

        let attributes = self
            .item_attributes
            .into_iter()
            .map(|attr| ItemAttribute {
                code: attr.code,
                ids: attr.ids,
            })
            .collect();

        let photo_urls = self
            .photos
            .iter()
            .filter_map(PhotoField::url)
            .map(|url| url.to_string())
            .collect();

        RemoteItemDetail {
            remote_id: self.id,
            title: self.title,
            description: self.description,
            price,
            currency,
            category_id,
            brand_id,
            size_id,
            condition_id,
            package_size_id,
            color_ids,
            attributes,
            photo_urls,
            lifecycle: lifecycle_from_flags(self.is_hidden, self.is_reserved, self.is_closed),
        }
    }
}

fn resolve_colors(field: Option<ColorsField>, color1: Option<i64>, color2: Option<i64>) -> Vec<i64> {
    match field {
        Some(ColorsField::Ids(ids)) => ids,
        Some(ColorsField::Objects(objects)) => {
            objects.iter().filter_map(EntityRef::id).collect()
        }
        None => {
            let mut ids = Vec::new();
            if let Some(id) = color1 {
                ids.push(id);
            }
            if let Some(id) = color2 {
                ids.push(id);
            }
            ids
        }
    }
}

pub fn item_detail(raw: &Value) -> Result<RemoteItemDetail, GatewayError> {
    let parsed: RawItemDetail = serde_json::from_value(raw.clone())
        .map_err(|err| GatewayError::Parse(format!("unrecognized item payload: {err}")))?;
    Ok(parsed.canonicalize())
}

/// Wardrobe summary rows carry fewer fields and yet more shape variety
/// (`price_numeric` as string, `catalog_id` vs nested category). Rows
/// without a usable id are dropped by the caller.
#[derive(Debug, Clone, Deserialize)]
struct RawListingSummary {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    price: Option<PriceField>,
    #[serde(default)]
    price_numeric: Option<AmountField>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default, alias = "category_id")]
    catalog_id: Option<i64>,
    #[serde(default)]
    is_hidden: bool,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    is_reserved: bool,
}

pub fn listing_summary(raw: &Value) -> Option<RemoteListing> {
    let parsed: RawListingSummary = serde_json::from_value(raw.clone()).ok()?;
    let price = parsed
        .price
        .as_ref()
        .and_then(PriceField::amount)
        .or_else(|| parsed.price_numeric.as_ref().and_then(AmountField::resolve));
    let currency = parsed
        .price
        .as_ref()
        .and_then(PriceField::currency)
        .or(parsed.currency);
    Some(RemoteListing {
        remote_id: parsed.id,
        title: parsed.title.unwrap_or_default(),
        price,
        currency,
        category_id: parsed.catalog_id,
        lifecycle: lifecycle_from_flags(parsed.is_hidden, parsed.is_reserved, parsed.is_closed),
    })
}
