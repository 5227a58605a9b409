use crate::vinted::config::BASE_URL;
use crate::vinted::{GatewayError, VintedGateway};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use uuid::Uuid;

/// Upload one photo as multipart form data; returns the platform photo id
/// to be referenced by a subsequent listing submission.
pub async fn upload_photo(gw: &VintedGateway, bytes: Vec<u8>) -> Result<i64, GatewayError> {
    gw.pace().await;
    let url = format!("{}/api/v2/photos", *BASE_URL);
    let referer = format!("{}/items/new", *BASE_URL);

    // Multipart sets its own boundary content type.
    let mut headers = gw.write_headers(&referer, false);
    headers.remove("Content-Type");

    let part = Part::bytes(bytes)
        .file_name("photo.jpg")
        .mime_str("image/jpeg")
        .map_err(|err| GatewayError::Upload(err.to_string()))?;
    let form = Form::new()
        .text("photo[type]", "item")
        .part("photo[file]", part)
        .text("photo[temp_uuid]", Uuid::new_v4().to_string());

    let response = gw
        .http
        .post(url)
        .headers(headers)
        .multipart(form)
        .send()
        .await
        .map_err(|err| GatewayError::Request(err.to_string()))?;
    let payload = VintedGateway::read_json(response, &[200, 201]).await?;
    payload
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::Upload("photo response carried no id".into()))
}
