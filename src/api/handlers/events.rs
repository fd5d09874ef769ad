//! Administration of event rules and handler metadata.

use crate::api::handlers::{ApiResponse, failure, ok};
use crate::events::store::StoreError;
use crate::events::{EventEngine, EventRule};
use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::Response,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

fn store_failure(err: &StoreError) -> Response {
    match err {
        StoreError::NotFound { .. } => failure(StatusCode::NOT_FOUND, err.to_string()),
        StoreError::Conflict(_) => failure(StatusCode::CONFLICT, err.to_string()),
        StoreError::Database(_) => {
            error!("Event rule store failed: {err}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        }
    }
}

fn unknown_handler(name: &str) -> Response {
    failure(StatusCode::NOT_FOUND, format!("unknown handler: {name}"))
}

#[utoipa::path(
    get,
    path = "/v1/events",
    responses(
        (status = 200, description = "All event rules", body = ApiResponse),
        (status = 500, description = "Rule store unavailable", body = ApiResponse)
    ),
    tag = "events",
)]
/// List every configured rule, active or not.
pub async fn list_rules(engine: Extension<Arc<EventEngine>>) -> Response {
    match engine.rule_store().list().await {
        Ok(rules) => ok(rules),
        Err(err) => store_failure(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/events/{id}",
    params(("id" = i64, Path, description = "Rule id")),
    responses(
        (status = 200, description = "The event rule", body = ApiResponse),
        (status = 404, description = "No such rule", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn get_rule(engine: Extension<Arc<EventEngine>>, Path(id): Path<i64>) -> Response {
    match engine.rule_store().get(id).await {
        Ok(Some(rule)) => ok(rule),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("rule not found: {id}")),
        Err(err) => store_failure(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = EventRule,
    responses(
        (status = 200, description = "Rule saved, value holds its id", body = ApiResponse),
        (status = 400, description = "Rule does not fit its handler", body = ApiResponse),
        (status = 404, description = "Rule id to update does not exist", body = ApiResponse),
        (status = 409, description = "Another rule has this name", body = ApiResponse)
    ),
    tag = "events",
)]
/// Create a rule, or update it when `id` is set. The rule is validated against the
/// handler's positions, actions, options and conditions before it is stored.
pub async fn save_rule(
    engine: Extension<Arc<EventEngine>>,
    Json(rule): Json<EventRule>,
) -> Response {
    if let Err(err) = engine.registry().validate(&rule) {
        warn!(rule = %rule.name, "Rejected event rule: {err}");
        return failure(StatusCode::BAD_REQUEST, err.to_string());
    }

    match engine.rule_store().save(&rule).await {
        Ok(id) => {
            info!(id, rule = %rule.name, handler = %rule.handler, "event rule saved");
            ok(json!({"id": id}))
        }
        Err(err) => store_failure(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/events/{id}",
    params(("id" = i64, Path, description = "Rule id")),
    responses(
        (status = 200, description = "Rule deleted", body = ApiResponse),
        (status = 404, description = "No such rule", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn delete_rule(engine: Extension<Arc<EventEngine>>, Path(id): Path<i64>) -> Response {
    match engine.rule_store().delete(id).await {
        Ok(()) => {
            info!(id, "event rule deleted");
            ok(true)
        }
        Err(err) => store_failure(&err),
    }
}

async fn set_active(engine: &EventEngine, id: i64, active: bool) -> Response {
    match engine.rule_store().set_active(id, active).await {
        Ok(()) => {
            info!(id, active, "event rule toggled");
            ok(true)
        }
        Err(err) => store_failure(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/events/{id}/enable",
    params(("id" = i64, Path, description = "Rule id")),
    responses(
        (status = 200, description = "Rule enabled", body = ApiResponse),
        (status = 404, description = "No such rule", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn enable_rule(engine: Extension<Arc<EventEngine>>, Path(id): Path<i64>) -> Response {
    set_active(&engine, id, true).await
}

#[utoipa::path(
    post,
    path = "/v1/events/{id}/disable",
    params(("id" = i64, Path, description = "Rule id")),
    responses(
        (status = 200, description = "Rule disabled", body = ApiResponse),
        (status = 404, description = "No such rule", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn disable_rule(engine: Extension<Arc<EventEngine>>, Path(id): Path<i64>) -> Response {
    set_active(&engine, id, false).await
}

#[utoipa::path(
    get,
    path = "/v1/events/handlers",
    responses((status = 200, description = "Registered handlers and their positions", body = ApiResponse)),
    tag = "events",
)]
pub async fn list_handlers(engine: Extension<Arc<EventEngine>>) -> Response {
    ok(engine.registry().list())
}

#[utoipa::path(
    get,
    path = "/v1/events/handlers/{name}/actions",
    params(("name" = String, Path, description = "Handler name")),
    responses(
        (status = 200, description = "Actions with their option schemas", body = ApiResponse),
        (status = 404, description = "No such handler", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn handler_actions(
    engine: Extension<Arc<EventEngine>>,
    Path(name): Path<String>,
) -> Response {
    match engine.registry().get(&name) {
        Some(handler) => ok(handler.actions()),
        None => unknown_handler(&name),
    }
}

#[utoipa::path(
    get,
    path = "/v1/events/handlers/{name}/conditions",
    params(("name" = String, Path, description = "Handler name")),
    responses(
        (status = 200, description = "Conditions the handler's rules may use", body = ApiResponse),
        (status = 404, description = "No such handler", body = ApiResponse)
    ),
    tag = "events",
)]
pub async fn handler_conditions(
    engine: Extension<Arc<EventEngine>>,
    Path(name): Path<String>,
) -> Response {
    match engine.registry().get(&name) {
        Some(handler) => ok(handler.conditions()),
        None => unknown_handler(&name),
    }
}
