//! Rule catalog handlers.

use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use vigil_engine::{RuleSet, RuleSource};
use vigil_models::{ModelId, RuleDocument, RuleId, Severity};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Reload request. An empty body reloads the configured rules file.
#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    /// Rules file to load instead of the configured one.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inline rule document.
    #[serde(default)]
    pub document: Option<RuleDocument>,
}

#[derive(Debug, Serialize)]
pub struct RuleSummary {
    pub id: RuleId,
    pub name: String,
    pub category: String,
    pub enabled: bool,
    pub severity: Severity,
    pub predicate: &'static str,
    pub required_models: Vec<ModelId>,
}

/// Published rule set.
#[derive(Debug, Serialize)]
pub struct RulesResponse {
    pub generation: u64,
    pub version: Option<String>,
    pub calibration_profile: String,
    pub profiles: Vec<String>,
    pub rules: Vec<RuleSummary>,
}

impl From<&RuleSet> for RulesResponse {
    fn from(set: &RuleSet) -> Self {
        Self {
            generation: set.generation(),
            version: set.version().map(str::to_string),
            calibration_profile: set.default_profile().name.clone(),
            profiles: set.profile_names().map(str::to_string).collect(),
            rules: set
                .rules()
                .iter()
                .map(|r| RuleSummary {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    category: r.category.clone(),
                    enabled: r.enabled,
                    severity: r.severity,
                    predicate: r.predicate.kind().as_str(),
                    required_models: r.required_models.clone(),
                })
                .collect(),
        }
    }
}

/// Current rule set.
pub async fn get_rules(State(state): State<AppState>) -> Json<RulesResponse> {
    Json(RulesResponse::from(state.coordinator.rules().as_ref()))
}

/// JSON Schema of the rule document.
pub async fn get_rules_schema() -> Json<schemars::schema::RootSchema> {
    Json(RuleDocument::schema())
}

/// Validate and publish a new rule set. A rejected document leaves the
/// current set in place and lists every violation.
pub async fn reload_rules(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<RulesResponse>> {
    let request: ReloadRequest = if body.is_empty() {
        ReloadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("invalid reload request: {e}")))?
    };

    let rules = match (request.document, request.path) {
        (Some(_), Some(_)) => return Err(ApiError::bad_request("give either document or path, not both")),
        (Some(document), None) => state.coordinator.reload_rules(RuleSource::Document(document)).await?,
        (None, Some(path)) => state.coordinator.reload_rules(RuleSource::File(path)).await?,
        (None, None) => state.coordinator.reload_from_config().await?,
    };

    info!(generation = rules.generation(), "Rules reloaded via admin API");
    Ok(Json(RulesResponse::from(rules.as_ref())))
}
