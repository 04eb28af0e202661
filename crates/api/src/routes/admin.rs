//! Runtime administration: rule reload and template updates.
//!
//! Both operations require an admin token, validate first and leave the
//! running configuration untouched on error.

use axum::extract::{Path, State};
use axum::routing::{post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::Template;
use herald_engine::rules::{default_rule_specs, load_rule_specs};
use herald_engine::template::TemplateError;

use crate::middleware::auth::AdminUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/admin/rules/reload", post(reload_rules))
        .route("/api/admin/templates/{id}", put(put_template))
}

/// POST /api/admin/rules/reload: re-read the rule file (or the built-in set).
async fn reload_rules(
    State(state): State<AppState>,
    AdminUser(auth): AdminUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let specs = match &state.config.rules_path {
        Some(path) => load_rule_specs(path).map_err(|e| AppError::Config(e.to_string()))?,
        None => default_rule_specs(),
    };

    let count = state
        .rules
        .reload(specs, &state.templates)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    tracing::info!(user_id = %auth.user_id, rules = count, "Rules reloaded via API");
    Ok(Json(json!({ "rules": count })))
}

#[derive(Debug, Deserialize)]
struct TemplateBody {
    title_pattern: String,
    body_pattern: String,
    #[serde(default)]
    variables: Vec<String>,
}

/// PUT /api/admin/templates/{id}: add or replace a template.
async fn put_template(
    State(state): State<AppState>,
    AdminUser(auth): AdminUser,
    Path(id): Path<String>,
    Json(body): Json<TemplateBody>,
) -> Result<Json<Template>, AppError> {
    let template = Template {
        id,
        title_pattern: body.title_pattern,
        body_pattern: body.body_pattern,
        variables: body.variables,
    };

    let replaced = state
        .templates
        .upsert(template.clone())
        .map_err(|e| match e {
            TemplateError::Invalid(msg) => AppError::Validation(msg),
            other => AppError::Internal(other.to_string()),
        })?;

    tracing::info!(
        user_id = %auth.user_id,
        template_id = %template.id,
        replaced,
        "Template stored via API"
    );
    Ok(Json(template))
}
