//! Admin endpoints for the session policy
//!
//! Changes apply to every session on its next `session.update`; sessions
//! already configured keep their current settings until then.

use axum::{Json, body::Bytes, extract::State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::relay::{PolicyField, PolicySettings, PolicyUpdate, RealtimeVoice, SessionPolicy};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

const ALL_FIELDS: [PolicyField; 9] = [
    PolicyField::Model,
    PolicyField::SystemMessage,
    PolicyField::Temperature,
    PolicyField::TopP,
    PolicyField::PresencePenalty,
    PolicyField::FrequencyPenalty,
    PolicyField::MaxTokens,
    PolicyField::DisableAudio,
    PolicyField::Voice,
];

/// Policy as reported by the admin surface.
#[derive(Debug, Serialize)]
pub struct PolicyView {
    pub current: PolicySettings,
    pub original: PolicySettings,
    /// Per field: whether it differs from the original.
    pub is_custom: BTreeMap<&'static str, bool>,
    pub voices: Vec<&'static str>,
}

impl PolicyView {
    fn of(policy: &SessionPolicy) -> Self {
        Self {
            current: policy.snapshot(),
            original: policy.original().clone(),
            is_custom: ALL_FIELDS
                .iter()
                .map(|field| (field.as_str(), policy.is_custom(*field)))
                .collect(),
            voices: RealtimeVoice::names(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RevertRequest {
    pub field: Option<String>,
}

/// `GET /admin/policy`
pub async fn get_policy(State(state): State<Arc<AppState>>) -> Json<PolicyView> {
    Json(PolicyView::of(&state.policy))
}

/// `PUT /admin/policy` - partial update; `null` clears a field.
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Json(update): Json<PolicyUpdate>,
) -> AppResult<Json<PolicyView>> {
    state.policy.update(update)?;
    Ok(Json(PolicyView::of(&state.policy)))
}

/// `POST /admin/policy/revert` - one field when `{"field": ...}` is given,
/// everything otherwise.
pub async fn revert_policy(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> AppResult<Json<PolicyView>> {
    let request: RevertRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RevertRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid revert request: {e}")))?
    };

    match request.field {
        Some(name) => {
            let field: PolicyField = name.parse()?;
            state.policy.revert(field);
        }
        None => {
            state.policy.revert_all();
        }
    }
    Ok(Json(PolicyView::of(&state.policy)))
}
