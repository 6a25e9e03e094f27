use crate::{
    domain::{ImageSource, ImageWriter},
    errors::{FetchError, MutationError},
    jsonp::JsonpClient,
    models::{ImageRecord, NewImage, UploadResponse},
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{self, info};

/// Reads the spreadsheet through the Apps Script web app.
#[derive(Clone)]
pub struct JsonpImageSource {
    client: JsonpClient,
    base_url: Url,
}

impl JsonpImageSource {
    pub fn new(client: JsonpClient, base_url: Url) -> Self {
        info!(%base_url, "Initializing JsonpImageSource");
        Self { client, base_url }
    }

    fn url_with(&self, key: &str, value: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair(key, value);
        url
    }
}

#[derive(Deserialize)]
struct SlugReply {
    #[serde(default)]
    data: Option<ImageRecord>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ImageSource for JsonpImageSource {
    async fn list(&self) -> Result<Vec<ImageRecord>, FetchError> {
        let payload = self.client.request(self.url_with("path", "list")).await?;

        match payload {
            Value::Array(rows) => {
                let total = rows.len();
                let records: Vec<ImageRecord> = rows
                    .into_iter()
                    .enumerate()
                    .filter_map(|(row, value)| match serde_json::from_value(value) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            tracing::warn!(row, error = %e, "Apps Script: skipping unreadable row");
                            None
                        }
                    })
                    .collect();
                tracing::debug!("Apps Script: list returned {} of {} records", records.len(), total);
                Ok(records)
            }
            other => {
                tracing::warn!(payload = %other, "Apps Script: list payload was not an array, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn by_slug(&self, slug: &str) -> Result<ImageRecord, FetchError> {
        let payload = self.client.request(self.url_with("slug", slug)).await?;
        let reply: SlugReply =
            serde_json::from_value(payload).map_err(|e| FetchError::Integration(e.to_string()))?;

        match (reply.data, reply.error) {
            (Some(record), _) => Ok(record),
            (None, Some(message)) if message != "Not found" => {
                tracing::error!(%slug, %message, "Apps Script: lookup failed");
                Err(FetchError::Backend(message))
            }
            (None, _) => {
                tracing::debug!(%slug, "Apps Script: no record for slug");
                Err(FetchError::NotFound(slug.to_string()))
            }
        }
    }
}

/// Sends write actions to the proxy as `{action, data}`.
#[derive(Debug, Clone)]
pub struct ProxyImageWriter {
    client: reqwest::Client,
    proxy_url: Url,
}

impl ProxyImageWriter {
    pub fn new(client: reqwest::Client, proxy_url: Url) -> Self {
        info!(%proxy_url, "Initializing ProxyImageWriter");
        Self { client, proxy_url }
    }

    async fn post(&self, action: &'static str, data: Value) -> Result<Value, MutationError> {
        tracing::debug!(%action, "Proxy: Sending action");
        let response = self
            .client
            .post(self.proxy_url.clone())
            .json(&json!({ "action": action, "data": data }))
            .send()
            .await
            .context(format!("Proxy: Failed to send '{}' action", action))?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(%action, status = status.as_u16(), "Proxy: Action failed");
            return Err(MutationError::Status {
                action,
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .context(format!("Proxy: '{}' reply was not JSON", action))?;
        reject_on_error(action, body)
    }
}

fn reject_on_error(action: &'static str, body: Value) -> Result<Value, MutationError> {
    match body.get("error") {
        Some(Value::String(message)) if !message.is_empty() => Err(MutationError::Rejected {
            action,
            message: message.clone(),
        }),
        _ => Ok(body),
    }
}

pub(crate) fn to_data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

fn parse_upload_reply(body: &Value) -> Result<UploadResponse, MutationError> {
    let field = |primary: &str, fallback: &str| {
        body.get(primary)
            .or_else(|| body.get(fallback))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let drive_file_id = field("driveFileId", "fileId")
        .ok_or_else(|| anyhow!("Proxy: upload reply is missing driveFileId"))?;
    let thumbnail_url = field("thumbnailUrl", "url").unwrap_or_default();

    Ok(UploadResponse {
        drive_file_id,
        thumbnail_url,
    })
}

/// The created row comes back as `{data: record}`, or bare from older deployments.
fn parse_create_reply(body: Value) -> Result<ImageRecord, MutationError> {
    let record = match body {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => map.remove("data").unwrap_or_default(),
        other => other,
    };
    let record = serde_json::from_value(record).context("Proxy: create reply is not an image record")?;
    Ok(record)
}

#[async_trait]
impl ImageWriter for ProxyImageWriter {
    async fn upload(&self, file_name: &str, mime_type: &str, data: Vec<u8>) -> Result<UploadResponse, MutationError> {
        let size = data.len();
        let payload = json!({
            "file": to_data_url(mime_type, &data),
            "fileName": file_name,
            "mimeType": mime_type,
        });

        let body = self.post("upload", payload).await?;
        let uploaded = parse_upload_reply(&body)?;
        info!(drive_file_id = %uploaded.drive_file_id, %file_name, size, "Proxy: Image uploaded");
        Ok(uploaded)
    }

    async fn create(&self, image: &NewImage) -> Result<ImageRecord, MutationError> {
        let data = serde_json::to_value(image).context("Proxy: Failed to encode new image")?;
        let body = self.post("create", data).await?;
        let record = parse_create_reply(body)?;
        info!(id = %record.id, slug = %record.slug, "Proxy: Image entry created");
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<(), MutationError> {
        self.post("delete", json!({ "id": id })).await?;
        info!(%id, "Proxy: Image entry deleted");
        Ok(())
    }
}
