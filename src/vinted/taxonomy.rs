//! Per-type taxonomy fetches for the ontology mirror. Each entity type has
//! its own upload-form endpoint; responses are flattened into
//! [`OntologyEntity`] rows (categories keep their tree via `parent_id`,
//! size groups parent their sizes).

use crate::models::{OntologyEntity, OntologyType};
use crate::vinted::config::BASE_URL;
use crate::vinted::{GatewayError, VintedGateway};
use serde_json::{Value, json};

pub async fn fetch(
    gw: &VintedGateway,
    kind: OntologyType,
) -> Result<Vec<OntologyEntity>, GatewayError> {
    match kind {
        OntologyType::Category => fetch_categories(gw).await,
        OntologyType::Brand => fetch_flat(gw, "item_upload/brands", &["brands"], kind).await,
        OntologyType::Color => fetch_flat(gw, "item_upload/colors", &["colors"], kind).await,
        OntologyType::Condition => {
            fetch_flat(gw, "item_upload/conditions", &["conditions", "statuses"], kind).await
        }
        OntologyType::Size => fetch_sizes(gw).await,
        OntologyType::Material => fetch_materials(gw).await,
        OntologyType::PackageSize => {
            fetch_flat(gw, "item_upload/package_sizes", &["package_sizes"], kind).await
        }
    }
}

async fn get_json(gw: &VintedGateway, path: &str) -> Result<Value, GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/{path}", *BASE_URL);
    let referer = format!("{}/items/new", *BASE_URL);
    let response = gw
        .http
        .get(url)
        .headers(gw.read_headers(&referer))
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    VintedGateway::read_json(response, &[200, 304]).await
}

fn array_field<'a>(payload: &'a Value, keys: &[&str]) -> Result<&'a Vec<Value>, GatewayError> {
    for key in keys {
        if let Some(list) = payload.get(*key).and_then(Value::as_array) {
            return Ok(list);
        }
    }
    Err(GatewayError::Parse(format!(
        "taxonomy payload carried none of {keys:?}"
    )))
}

fn entity_from_value(
    raw: &Value,
    kind: OntologyType,
    parent_id: Option<i64>,
) -> Option<OntologyEntity> {
    let entity_id = raw.get("id").and_then(Value::as_i64)?;
    let name = raw
        .get("title")
        .or_else(|| raw.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let extra = match kind {
        OntologyType::Color => raw
            .get("hex")
            .or_else(|| raw.get("code"))
            .map(|hex| json!({ "hex": hex })),
        _ => None,
    };
    Some(OntologyEntity {
        entity_id,
        entity_type: kind,
        parent_id,
        name,
        extra,
    })
}

/// The category endpoint returns the full tree with nested children;
/// flatten it, recording each node's parent.
async fn fetch_categories(gw: &VintedGateway) -> Result<Vec<OntologyEntity>, GatewayError> {
    let payload = get_json(gw, "item_upload/catalogs").await?;
    let roots = array_field(&payload, &["catalogs"])?;
    let mut entities = Vec::new();
    for root in roots {
        flatten_category(root, None, &mut entities, 0);
    }
    Ok(entities)
}

fn flatten_category(
    node: &Value,
    parent_id: Option<i64>,
    out: &mut Vec<OntologyEntity>,
    depth: u32,
) {
    if depth > 16 {
        return;
    }
    let Some(entity) = entity_from_value(node, OntologyType::Category, parent_id) else {
        return;
    };
    let entity_id = entity.entity_id;
    out.push(entity);
    if let Some(children) = node.get("catalogs").and_then(Value::as_array) {
        for child in children {
            flatten_category(child, Some(entity_id), out, depth + 1);
        }
    }
}

async fn fetch_flat(
    gw: &VintedGateway,
    path: &str,
    keys: &[&str],
    kind: OntologyType,
) -> Result<Vec<OntologyEntity>, GatewayError> {
    let payload = get_json(gw, path).await?;
    let rows = array_field(&payload, keys)?;
    Ok(rows
        .iter()
        .filter_map(|raw| entity_from_value(raw, kind, None))
        .collect())
}

/// Size groups nest their sizes; both levels land in the mirror, sizes
/// pointing at their group.
async fn fetch_sizes(gw: &VintedGateway) -> Result<Vec<OntologyEntity>, GatewayError> {
    let payload = get_json(gw, "item_upload/size_groups").await?;
    let groups = array_field(&payload, &["size_groups"])?;
    let mut entities = Vec::new();
    for group in groups {
        let Some(group_entity) = entity_from_value(group, OntologyType::Size, None) else {
            continue;
        };
        let group_id = group_entity.entity_id;
        entities.push(group_entity);
        if let Some(sizes) = group.get("sizes").and_then(Value::as_array) {
            for size in sizes {
                if let Some(entity) = entity_from_value(size, OntologyType::Size, Some(group_id)) {
                    entities.push(entity);
                }
            }
        }
    }
    Ok(entities)
}

/// Materials come back from the attributes endpoint, a POST with the
/// requested code in the body.
async fn fetch_materials(gw: &VintedGateway) -> Result<Vec<OntologyEntity>, GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/item_upload/attributes", *BASE_URL);
    let referer = format!("{}/items/new", *BASE_URL);
    let body = json!({ "attributes": [{ "code": "material", "value": [] }] });
    let response = gw
        .http
        .post(url)
        .headers(gw.write_headers(&referer, false))
        .json(&body)
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    let payload = VintedGateway::read_json(response, &[200, 304]).await?;

    let mut entities = Vec::new();
    if let Some(attributes) = payload.get("attributes").and_then(Value::as_array) {
        for attribute in attributes {
            if let Some(options) = attribute.get("options").and_then(Value::as_array) {
                for option in options {
                    if let Some(entity) =
                        entity_from_value(option, OntologyType::Material, None)
                    {
                        entities.push(entity);
                    }
                }
            }
        }
    }
    Ok(entities)
}
