//! Balanced send endpoint — the hot path that ties the balancer, the
//! send capability, and the event dispatcher together.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;

use crate::balancer::BalancerError;
use crate::events::EventKind;
use crate::instances;
use crate::sender::{self, SendError, SendTextRequest};
use crate::state::AppState;

use super::{ApiError, internal};

/// Destination: leading digits, then at least one more word/domain
/// character (`5511999990001` and `5511999990001@s.whatsapp.net` both
/// pass; a lone digit does not).
static NUMBER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\d+[.@\w-]+$").expect("number regex"));

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalancedSendRequest {
    pub alias: String,
    pub number: String,
    pub text: String,
    pub delay: Option<u32>,
    pub quoted: Option<Value>,
    pub link_preview: Option<bool>,
    pub mentions_every_one: Option<bool>,
    pub mentioned: Option<Vec<String>>,
}

impl BalancedSendRequest {
    fn validate(&self) -> Result<(), String> {
        if self.alias.is_empty() {
            return Err("alias must be non-empty".into());
        }
        if !NUMBER_RE.is_match(&self.number) {
            return Err(format!("invalid number: {:?}", self.number));
        }
        if self.text.is_empty() {
            return Err("text must be non-empty".into());
        }
        if let Some(mentioned) = &self.mentioned {
            for m in mentioned {
                if !NUMBER_RE.is_match(m) {
                    return Err(format!("invalid mentioned number: {:?}", m));
                }
            }
        }
        Ok(())
    }
}

impl From<BalancerError> for ApiError {
    fn from(e: BalancerError) -> Self {
        match e {
            BalancerError::GroupNotFound(alias) => {
                ApiError::NotFound(format!("group with alias {:?} not found", alias))
            }
            BalancerError::GroupDisabled(alias) => {
                ApiError::BadRequest(format!("group {:?} is disabled", alias))
            }
            BalancerError::NoActiveInstance => {
                ApiError::BadRequest("No active instances available in group".into())
            }
            BalancerError::Storage(e) => internal("balancer storage error", e),
        }
    }
}

#[utoipa::path(post, path = "/message/sendTextWithGroupBalancing", tag = "messages",
    request_body = BalancedSendRequest,
    responses(
        (status = 200, description = "Send result with balancing metadata"),
        (status = 400, description = "Validation failure, disabled group, or empty pool"),
        (status = 404, description = "Unknown alias")))]
pub async fn send_text_with_group_balancing(
    State(state): State<AppState>,
    Json(req): Json<BalancedSendRequest>,
) -> Result<Json<Value>, ApiError> {
    req.validate().map_err(ApiError::BadRequest)?;

    let (instance_name, group_id, info) = state
        .balancer
        .select_for_contact_in_group(&req.alias, &req.number)
        .await?;

    let instance = instances::get_by_name(&state.db, &instance_name)
        .await
        .map_err(|e| internal("failed to load instance", e))?
        .ok_or_else(|| {
            ApiError::Internal(format!(
                "selected instance {} has no backing record",
                instance_name
            ))
        })?;

    let send_req = SendTextRequest {
        number: req.number.clone(),
        text: req.text.clone(),
        delay: req.delay,
        quoted: req.quoted.clone(),
        link_preview: req.link_preview,
        mentions_every_one: req.mentions_every_one,
        mentioned: req.mentioned.clone(),
    };

    let result = sender::send_text(&state.http_client, &instance, &send_req)
        .await
        .map_err(|e| match e {
            SendError::Rejected { status, body, instance } => ApiError::Upstream(format!(
                "instance {} rejected send ({}): {}",
                instance, status, body
            )),
            SendError::Unreachable { instance, source } => {
                ApiError::Upstream(format!("instance {} unreachable: {}", instance, source))
            }
        })?;

    state.emit_event(
        EventKind::SendMessage,
        json!({
            "number": &req.number,
            "groupAlias": &req.alias,
            "result": result.clone(),
        }),
        Some(instance_name.clone()),
    );

    tracing::info!(
        "balanced send: alias={} contact={} -> {}",
        req.alias,
        info.contact,
        instance_name
    );

    // Augment the worker's send result with the balancing metadata.
    let mut response = match result {
        Value::Object(map) => Value::Object(map),
        other => json!({ "result": other }),
    };
    if let Some(map) = response.as_object_mut() {
        map.insert("instanceUsed".into(), json!(instance_name));
        map.insert("groupId".into(), json!(group_id.to_string()));
        map.insert("groupAlias".into(), json!(req.alias));
        map.insert(
            "balancingInfo".into(),
            serde_json::to_value(&info).map_err(|e| internal("balancing info", e))?,
        );
    }
    Ok(Json(response))
}
