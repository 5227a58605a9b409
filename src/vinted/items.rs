//! Listing CRUD against the platform, full-detail extraction from SSR item
//! pages, and the composite stealth relist sequence.

use crate::mutate;
use crate::vinted::config::{BASE_URL, POST_DELETE_PAUSE_SECS};
use crate::vinted::{GatewayError, ListingDraft, RelistOutcome, RemoteItemDetail, VintedGateway};
use crate::vinted::{normalize, photos};
use rand::Rng;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

fn item_payload(draft: &ListingDraft, item_id: Option<i64>, assigned_photos: &[i64]) -> Value {
    let photos: Vec<Value> = assigned_photos
        .iter()
        .map(|id| json!({"id": id, "orientation": 0}))
        .collect();
    json!({
        "item": {
            "id": item_id,
            "title": draft.title,
            "description": draft.description,
            "price": draft.price,
            "currency": draft.currency,
            "catalog_id": draft.category_id,
            "brand_id": draft.brand_id,
            "size_id": draft.size_id,
            "status_id": draft.condition_id,
            "package_size_id": draft.package_size_id,
            "color_ids": draft.color_ids,
            "item_attributes": draft.attributes,
            "assigned_photos": photos,
        },
        "feedback_id": null,
        "push_up": false,
        "parcel": null,
        "upload_session_id": Uuid::new_v4().to_string(),
    })
}

fn extract_listing_id(payload: &Value) -> Result<i64, GatewayError> {
    payload
        .get("item")
        .and_then(|item| item.get("id"))
        .or_else(|| payload.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::Parse("create response carried no item id".into()))
}

/// POST the new listing and publish it; returns the remote item id.
pub async fn create_listing(
    gw: &VintedGateway,
    draft: &ListingDraft,
    assigned_photos: Option<&[i64]>,
) -> Result<i64, GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/item_upload/items", *BASE_URL);
    let referer = format!("{}/items/new", *BASE_URL);
    let body = item_payload(draft, None, assigned_photos.unwrap_or(&[]));
    let response = gw
        .http
        .post(url)
        .headers(gw.write_headers(&referer, true))
        .json(&body)
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    let payload = VintedGateway::read_json(response, &[200, 201]).await?;
    extract_listing_id(&payload)
}

pub async fn update_listing(
    gw: &VintedGateway,
    remote_id: i64,
    draft: &ListingDraft,
) -> Result<(), GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/item_upload/items/{remote_id}", *BASE_URL);
    let referer = format!("{}/items/{remote_id}/edit", *BASE_URL);
    let body = item_payload(draft, Some(remote_id), &[]);
    let response = gw
        .http
        .put(url)
        .headers(gw.write_headers(&referer, true))
        .json(&body)
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    if response.status().as_u16() == 404 {
        return Err(GatewayError::NotFound(remote_id));
    }
    VintedGateway::read_json(response, &[200]).await?;
    Ok(())
}

/// Deletion is a POST with an empty body on this platform.
pub async fn delete_listing(gw: &VintedGateway, remote_id: i64) -> Result<(), GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/items/{remote_id}/delete", *BASE_URL);
    let referer = format!("{}/items/{remote_id}", *BASE_URL);
    let mut headers = gw.write_headers(&referer, false);
    headers.remove("Content-Type");
    let response = gw
        .http
        .post(url)
        .headers(headers)
        .header("Content-Length", "0")
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    if response.status().as_u16() == 404 {
        return Err(GatewayError::NotFound(remote_id));
    }
    VintedGateway::read_json(response, &[200]).await?;
    Ok(())
}

/// Full stealth relist under one session:
/// 1. mutate and upload every photo (short human-ish pause between uploads),
/// 2. delete the old listing,
/// 3. hold for the post-delete pause,
/// 4. publish the replacement with the jittered draft and fresh photo ids.
pub async fn relist_item(
    gw: &VintedGateway,
    old_remote_id: i64,
    draft: &ListingDraft,
    images: Vec<Vec<u8>>,
    relist_count: i64,
) -> Result<RelistOutcome, GatewayError> {
    let mut photo_ids = Vec::new();
    for bytes in images {
        let upload_bytes = match mutate::mutate_image(&bytes, relist_count) {
            Ok(mutated) => mutated,
            Err(err) => {
                warn!(
                    target = "vault.gateway",
                    error = %err,
                    "image mutation failed; uploading original bytes"
                );
                bytes
            }
        };
        let photo_id = photos::upload_photo(gw, upload_bytes).await?;
        photo_ids.push(photo_id);
        let pause_ms = {
            let mut rng = rand::rng();
            rng.random_range(300..=800u64)
        };
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }
    if photo_ids.is_empty() {
        return Err(GatewayError::Upload("no photos were uploaded".into()));
    }

    delete_listing(gw, old_remote_id).await?;
    tokio::time::sleep(Duration::from_secs(*POST_DELETE_PAUSE_SECS)).await;

    let new_remote_id = create_listing(gw, draft, Some(&photo_ids)).await?;
    Ok(RelistOutcome {
        new_remote_id,
        photo_ids,
    })
}

/// Full item detail is not served by a public JSON route; it is embedded in
/// the item page by the SSR framework. Fetch the page and extract it, then
/// normalize the result.
pub async fn fetch_item_detail(
    gw: &VintedGateway,
    remote_id: i64,
) -> Result<RemoteItemDetail, GatewayError> {
    gw.pace().await;
    let url = format!("{}/items/{remote_id}", *BASE_URL);
    let referer = format!("{}/catalog", *BASE_URL);
    let mut headers = gw.read_headers(&referer);
    // Page navigation, not an API call.
    for (name, value) in [
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-User", "?1"),
        ("Upgrade-Insecure-Requests", "1"),
    ] {
        if let Ok(parsed) = reqwest::header::HeaderValue::from_str(value) {
            headers.insert(name, parsed);
        }
    }

    let response = gw
        .http
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    let status = response.status();
    if status.as_u16() == 404 {
        return Err(GatewayError::NotFound(remote_id));
    }
    if let Some(err) = VintedGateway::classify_status(status) {
        return Err(err);
    }
    if !status.is_success() {
        return Err(GatewayError::Request(format!("HTTP {status}")));
    }
    let html = response
        .text()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;

    // An HTML body is expected here; only an explicit challenge marker
    // counts as a block.
    let head: String = html.chars().take(2000).collect::<String>().to_lowercase();
    if head.contains("datadome") && head.contains("captcha") {
        return Err(GatewayError::Challenge);
    }

    let raw = extract_item_payload(&html, remote_id).ok_or_else(|| {
        GatewayError::Parse(format!(
            "no item data for {remote_id} in page (len={})",
            html.len()
        ))
    })?;
    normalize::item_detail(&raw)
}

/// Pull the item object out of the page source. SSR payload first, then
/// Schema.org JSON-LD as fallback.
pub(crate) fn extract_item_payload(html: &str, remote_id: i64) -> Option<Value> {
    for block in script_blocks(html, "id=\"__NUXT_DATA__\"") {
        if let Some(data) = parse_ssr_payload(block.trim())
            && let Some(item) = find_item(&data, remote_id, 0)
        {
            return Some(item);
        }
    }
    for block in script_blocks(html, "application/ld+json") {
        if let Ok(parsed) = serde_json::from_str::<Value>(block.trim()) {
            let entries: Vec<&Value> = match &parsed {
                Value::Array(list) => list.iter().collect(),
                other => vec![other],
            };
            for entry in entries {
                if entry.get("@type").and_then(Value::as_str) == Some("Product") {
                    return Some(schema_org_item(entry, remote_id));
                }
            }
        }
    }
    None
}

/// All `<script ...MARKER...>body</script>` bodies, located by plain string
/// scanning.
fn script_blocks<'a>(html: &'a str, marker: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let mut rest = html;
    while let Some(script_at) = rest.find("<script") {
        let after_tag = &rest[script_at..];
        let Some(open_end) = after_tag.find('>') else {
            break;
        };
        let tag = &after_tag[..open_end];
        let body_and_beyond = &after_tag[open_end + 1..];
        let Some(close_at) = body_and_beyond.find("</script>") else {
            break;
        };
        if tag.contains(marker) {
            blocks.push(&body_and_beyond[..close_at]);
        }
        rest = &body_and_beyond[close_at + "</script>".len()..];
    }
    blocks
}

/// The SSR framework serializes state as a flat array where object values
/// are indices into the same array. Resolve the reference graph back into a
/// plain JSON tree, starting at node 1 (node 0 is the header).
fn parse_ssr_payload(raw: &str) -> Option<Value> {
    let arr: Vec<Value> = serde_json::from_str(raw).ok()?;
    if arr.len() <= 1 {
        return None;
    }
    let header = arr.first()?.as_array()?;
    let kind = header.first()?.as_str()?;
    if kind != "Reactive" && kind != "ShallowReactive" {
        return None;
    }
    Some(resolve_ssr_node(&arr, 1, 0))
}

fn resolve_ssr_node(arr: &[Value], idx: usize, depth: u32) -> Value {
    if depth > 40 || idx >= arr.len() {
        return Value::Null;
    }
    match &arr[idx] {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let resolved = match value.as_u64() {
                    Some(reference) => resolve_ssr_node(arr, reference as usize, depth + 1),
                    None => value.clone(),
                };
                out.insert(key.clone(), resolved);
            }
            Value::Object(out)
        }
        Value::Array(list) => {
            if list.is_empty() {
                return Value::Array(vec![]);
            }
            if let Some(first) = list[0].as_str() {
                match first {
                    "Ref" | "EmptyRef" | "EmptyShallowRef" | "ShallowReactive" | "Reactive" => {
                        return list
                            .get(1)
                            .and_then(Value::as_u64)
                            .map(|reference| resolve_ssr_node(arr, reference as usize, depth + 1))
                            .unwrap_or(Value::Null);
                    }
                    "Set" => {
                        let resolved = list[1..]
                            .iter()
                            .map(|value| match value.as_u64() {
                                Some(reference) => {
                                    resolve_ssr_node(arr, reference as usize, depth + 1)
                                }
                                None => value.clone(),
                            })
                            .collect();
                        return Value::Array(resolved);
                    }
                    // Dict-as-list: ["null", key1, ref1, key2, ref2, ...]
                    "null" => {
                        let mut out = serde_json::Map::new();
                        let mut i = 1;
                        while i + 1 < list.len() {
                            if let Some(key) = list[i].as_str() {
                                let value = match list[i + 1].as_u64() {
                                    Some(reference) => {
                                        resolve_ssr_node(arr, reference as usize, depth + 1)
                                    }
                                    None => list[i + 1].clone(),
                                };
                                out.insert(key.to_string(), value);
                            }
                            i += 2;
                        }
                        return Value::Object(out);
                    }
                    _ => {}
                }
            }
            let resolved = list
                .iter()
                .map(|value| match value.as_u64() {
                    Some(reference) => resolve_ssr_node(arr, reference as usize, depth + 1),
                    None => value.clone(),
                })
                .collect();
            Value::Array(resolved)
        }
        leaf => leaf.clone(),
    }
}

fn find_item(data: &Value, remote_id: i64, depth: u32) -> Option<Value> {
    if depth > 25 {
        return None;
    }
    match data {
        Value::Object(map) => {
            if map.get("id").and_then(Value::as_i64) == Some(remote_id)
                && (map.contains_key("title") || map.contains_key("description"))
            {
                return Some(data.clone());
            }
            map.values().find_map(|v| find_item(v, remote_id, depth + 1))
        }
        Value::Array(list) => list.iter().find_map(|v| find_item(v, remote_id, depth + 1)),
        _ => None,
    }
}

/// Convert Schema.org Product markup into the flat item shape the
/// normalization layer understands.
fn schema_org_item(schema: &Value, remote_id: i64) -> Value {
    let mut item = serde_json::Map::new();
    item.insert("id".into(), json!(remote_id));
    item.insert(
        "title".into(),
        schema.get("name").cloned().unwrap_or(json!("")),
    );
    if let Some(description) = schema.get("description") {
        item.insert("description".into(), description.clone());
    }
    if let Some(offers) = schema.get("offers").filter(|v| v.is_object()) {
        if let Some(price) = offers.get("price") {
            item.insert("price".into(), price.clone());
        }
        if let Some(currency) = offers.get("priceCurrency") {
            item.insert("currency".into(), currency.clone());
        }
    }
    if let Some(brand) = schema.get("brand").and_then(|b| b.get("name")) {
        item.insert("brand".into(), brand.clone());
    }
    if let Some(condition) = schema.get("itemCondition").and_then(Value::as_str) {
        let status_id = match condition {
            "https://schema.org/NewCondition" => Some(6),
            "https://schema.org/UsedCondition" => Some(3),
            "https://schema.org/RefurbishedCondition" => Some(2),
            _ => None,
        };
        if let Some(id) = status_id {
            item.insert("status_id".into(), json!(id));
        }
    }
    if let Some(images) = schema.get("image").and_then(Value::as_array) {
        item.insert("photos".into(), json!(images));
    }
    Value::Object(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_blocks_finds_marked_scripts() {
        let html = r#"<html><script src="app.js"></script>
            <script type="application/ld+json">{"@type":"Product"}</script>
            <script id="__NUXT_DATA__" type="application/json">[1,2]</script></html>"#;
        assert_eq!(script_blocks(html, "application/ld+json").len(), 1);
        assert_eq!(script_blocks(html, "id=\"__NUXT_DATA__\"").len(), 1);
        assert!(script_blocks(html, "nothing").is_empty());
    }

    #[test]
    fn ssr_payload_resolves_references() {
        // Every scalar lives in the array and is referenced by index, the id
        // included: [header, root{item: ref2}, {id: ref5, ...}, "Coat", 12.5, 77]
        let raw = r#"[["Reactive",1],{"item":2},{"id":5,"title":3,"price":4},"Coat",12.5,77]"#;
        let data = parse_ssr_payload(raw).unwrap();
        let item = find_item(&data, 77, 0).unwrap();
        assert_eq!(item["title"], "Coat");
        assert_eq!(item["price"], 12.5);
    }

    #[test]
    fn ssr_dict_as_list_resolves() {
        let raw = r#"[["Reactive",1],["null","id",2,"title",3],77,"Scarf"]"#;
        let data = parse_ssr_payload(raw).unwrap();
        let item = find_item(&data, 77, 0).unwrap();
        assert_eq!(item["title"], "Scarf");
    }

    #[test]
    fn non_ssr_array_is_rejected() {
        assert!(parse_ssr_payload(r#"[1,2,3]"#).is_none());
        assert!(parse_ssr_payload(r#"{"not":"array"}"#).is_none());
    }

    #[test]
    fn extracts_from_json_ld_fallback() {
        let html = r#"<script type="application/ld+json">
            {"@type":"Product","name":"Linen shirt","offers":{"price":"9.50","priceCurrency":"GBP"},
             "itemCondition":"https://schema.org/UsedCondition",
             "image":["https://cdn.example/a.jpg"]}
        </script>"#;
        let raw = extract_item_payload(html, 55).unwrap();
        assert_eq!(raw["id"], 55);
        assert_eq!(raw["title"], "Linen shirt");
        assert_eq!(raw["status_id"], 3);
        let detail = normalize::item_detail(&raw).unwrap();
        assert_eq!(detail.price, Some(9.5));
        assert_eq!(detail.photo_urls, vec!["https://cdn.example/a.jpg"]);
    }

    #[test]
    fn listing_payload_shape() {
        let draft = ListingDraft {
            title: "Coat".into(),
            description: Some("warm".into()),
            price: Some(20.0),
            currency: Some("GBP".into()),
            category_id: Some(1904),
            brand_id: Some(3),
            size_id: None,
            condition_id: Some(2),
            package_size_id: Some(1),
            color_ids: vec![9],
            attributes: vec![],
        };
        let payload = item_payload(&draft, None, &[11, 12]);
        assert!(payload["item"]["id"].is_null());
        assert_eq!(payload["item"]["catalog_id"], 1904);
        assert_eq!(payload["item"]["status_id"], 2);
        assert_eq!(payload["item"]["assigned_photos"][1]["id"], 12);
        assert_eq!(payload["push_up"], false);
        assert!(payload["upload_session_id"].is_string());
    }
}
