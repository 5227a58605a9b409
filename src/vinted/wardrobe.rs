use crate::vinted::config::BASE_URL;
use crate::vinted::{GatewayError, RemoteListing, VintedGateway, normalize};
use serde_json::Value;
use tracing::warn;

// Safety stop for the pagination loop; no real account approaches this.
const MAX_PAGES: usize = 200;

pub async fn fetch_page(
    gw: &VintedGateway,
    page: usize,
) -> Result<Vec<RemoteListing>, GatewayError> {
    gw.pace().await;
    let user_id = gw.session.user_id;
    let per_page = gw.session.per_page;
    let url = format!(
        "{}/api/v2/wardrobe/{user_id}/items?page={page}&per_page={per_page}&order=relevance",
        *BASE_URL
    );
    let referer = format!("{}/member/{user_id}", *BASE_URL);
    let response = gw
        .http
        .get(url)
        .headers(gw.read_headers(&referer))
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    let payload = VintedGateway::read_json(response, &[200, 304]).await?;

    let rows = payload
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("wardrobe payload carried no items array".into()))?;
    let listings: Vec<RemoteListing> = rows.iter().filter_map(normalize::listing_summary).collect();
    if listings.len() < rows.len() {
        warn!(
            target = "vault.gateway",
            dropped = rows.len() - listings.len(),
            page = page,
            "dropped wardrobe rows without a usable id"
        );
    }
    Ok(listings)
}

/// Whole-account snapshot; pages are fetched until one comes back short.
pub async fn fetch_all(gw: &VintedGateway) -> Result<Vec<RemoteListing>, GatewayError> {
    let per_page = gw.session.per_page;
    let mut listings = Vec::new();
    for page in 1..=MAX_PAGES {
        let batch = fetch_page(gw, page).await?;
        let batch_len = batch.len();
        listings.extend(batch);
        if batch_len < per_page {
            break;
        }
    }
    Ok(listings)
}
