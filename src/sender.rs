//! Outbound send capability — forwards a text message to the backend
//! worker that owns the selected instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instances::InstanceRow;

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest {
    pub number: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_preview: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions_every_one: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentioned: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("instance {instance} rejected send ({status}): {body}")]
    Rejected {
        instance: String,
        status: u16,
        body: String,
    },
    #[error("instance {instance} unreachable: {source}")]
    Unreachable {
        instance: String,
        source: reqwest::Error,
    },
}

const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// POST the message to `{base_url}/message/sendText` on the worker.
/// The worker's send result comes back verbatim so the handler can
/// augment it with balancing metadata.
pub async fn send_text(
    http: &reqwest::Client,
    instance: &InstanceRow,
    req: &SendTextRequest,
) -> Result<Value, SendError> {
    let url = format!(
        "{}/message/sendText",
        instance.base_url.trim_end_matches('/')
    );

    let mut request = http.post(&url).timeout(SEND_TIMEOUT).json(req);
    if let Some(key) = instance.api_key.as_deref() {
        request = request.header("apikey", key);
    }

    let resp = request.send().await.map_err(|e| SendError::Unreachable {
        instance: instance.name.clone(),
        source: e,
    })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::error!(
            "send_text: instance {} returned {}: {}",
            instance.name,
            status.as_u16(),
            body
        );
        return Err(SendError::Rejected {
            instance: instance.name.clone(),
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<Value>().await.map_err(|e| SendError::Unreachable {
        instance: instance.name.clone(),
        source: e,
    })
}
