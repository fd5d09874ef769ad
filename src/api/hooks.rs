//! Request pipeline hook running event rules around a route.
//!
//! The hook snapshots the request parameters (query plus a JSON or form body), runs the
//! `pre` rules, writes mangled parameters back into the request, runs the route, buffers
//! a JSON response for the `post` rules and serialises what they left behind. A `pre` rule
//! that already produced a response (federation) replaces the route. Responses of events
//! without `post` rules, or larger than the body limit, are streamed through untouched.

use crate::api::handlers::failure;
use crate::events::{
    Actor, DispatchError, EventContext, EventEngine, Position, RequestSnapshot, ResponseSnapshot,
    Role,
};
use axum::{
    Json,
    body::{Body, Bytes, HttpBody},
    extract::{ConnectInfo, Extension, MatchedPath, Request},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode, Uri, header, request::Parts,
        uri::PathAndQuery,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event names of the hooked routes, by method and route template.
pub const HOOKED_ROUTES: &[(&str, &str, &str)] = &[
    ("GET", "/v1/events", "event_list"),
    ("POST", "/v1/events", "event_save"),
    ("GET", "/v1/events/{id}", "event_get"),
    ("DELETE", "/v1/events/{id}", "event_delete"),
    ("POST", "/v1/events/{id}/enable", "event_enable"),
    ("POST", "/v1/events/{id}/disable", "event_disable"),
];

/// Shared state of the hook, inserted as an `Extension`.
pub struct Pipeline {
    pub engine: Arc<EventEngine>,
    pub max_body_bytes: usize,
}

#[must_use]
pub fn event_for(method: &Method, route: &str) -> Option<&'static str> {
    HOOKED_ROUTES
        .iter()
        .find(|(hooked, path, _)| *hooked == method.as_str() && *path == route)
        .map(|(_, _, event)| *event)
}

/// Where the parameters of a request came from.
#[derive(Debug, Clone, PartialEq)]
enum BodyParams {
    None,
    Json(Map<String, Value>),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
struct ParsedRequest {
    query: Vec<(String, String)>,
    body: BodyParams,
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Scalars keep their text form; arrays and objects are passed as JSON text.
fn param_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_request(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> ParsedRequest {
    let query = uri
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let body = if body.is_empty() {
        BodyParams::None
    } else if is_json(headers) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(object)) => BodyParams::Json(object),
            _ => BodyParams::None,
        }
    } else if is_form(headers) {
        BodyParams::Form(url::form_urlencoded::parse(body).into_owned().collect())
    } else {
        BodyParams::None
    };

    ParsedRequest { query, body }
}

impl ParsedRequest {
    /// Flat parameter map; body values win over query values.
    fn params(&self) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = self.query.iter().cloned().collect();
        match &self.body {
            BodyParams::None => {}
            BodyParams::Json(object) => {
                for (key, value) in object {
                    params.insert(key.clone(), param_text(value));
                }
            }
            BodyParams::Form(pairs) => params.extend(pairs.iter().cloned()),
        }
        params
    }

    /// Apply the difference between `before` and `after` to the original query and body.
    /// Changed keys stay where they were; new keys go into the body when there is one.
    fn apply(&mut self, before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) {
        let removed: BTreeSet<&String> = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .collect();
        self.query.retain(|(key, _)| !removed.contains(key));

        let in_body = |body: &BodyParams, key: &str| match body {
            BodyParams::None => false,
            BodyParams::Json(object) => object.contains_key(key),
            BodyParams::Form(pairs) => pairs.iter().any(|(name, _)| name == key),
        };

        match &mut self.body {
            BodyParams::None => {}
            BodyParams::Json(object) => object.retain(|key, _| !removed.contains(key)),
            BodyParams::Form(pairs) => pairs.retain(|(key, _)| !removed.contains(key)),
        }

        for (key, value) in after {
            if before.get(key) == Some(value) {
                continue;
            }
            let in_query = self.query.iter().any(|(name, _)| name == key);
            if in_body(&self.body, key) || (!in_query && self.body != BodyParams::None) {
                match &mut self.body {
                    BodyParams::None => {}
                    BodyParams::Json(object) => {
                        let typed = match object.get(key) {
                            Some(Value::String(_)) | None => Value::String(value.clone()),
                            Some(_) => serde_json::from_str(value)
                                .unwrap_or_else(|_| Value::String(value.clone())),
                        };
                        object.insert(key.clone(), typed);
                    }
                    BodyParams::Form(pairs) => {
                        pairs.retain(|(name, _)| name != key);
                        pairs.push((key.clone(), value.clone()));
                    }
                }
            } else {
                self.query.retain(|(name, _)| name != key);
                self.query.push((key.clone(), value.clone()));
            }
        }
    }

    fn query_string(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.query)
                .finish(),
        )
    }

    fn body_bytes(&self) -> Option<Bytes> {
        match &self.body {
            BodyParams::None => None,
            BodyParams::Json(object) => serde_json::to_vec(object).ok().map(Bytes::from),
            BodyParams::Form(pairs) => Some(Bytes::from(
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish(),
            )),
        }
    }
}

/// Rewrite the URI query and body of `parts` after `pre` rules changed the parameters.
fn rewrite(parts: &mut Parts, body: &mut Bytes, parsed: &ParsedRequest) {
    let path = parts.uri.path().to_string();
    let path_and_query = match parsed.query_string() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let mut uri = parts.uri.clone().into_parts();
    match path_and_query.parse::<PathAndQuery>() {
        Ok(value) => uri.path_and_query = Some(value),
        Err(err) => warn!("Failed to rewrite request query: {err}"),
    }
    if let Ok(rebuilt) = Uri::from_parts(uri) {
        parts.uri = rebuilt;
    }

    if let Some(bytes) = parsed.body_bytes() {
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        *body = bytes;
    }
}

fn request_snapshot(parts: &Parts, params: BTreeMap<String, String>) -> RequestSnapshot {
    let mut request = RequestSnapshot::new(parts.method.as_str(), parts.uri.path());
    request.params = params;
    request.authorization = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| SecretString::from(value.to_string()));
    request
}

fn context(event: &str, parts: &Parts, params: BTreeMap<String, String>) -> EventContext {
    let mut request = request_snapshot(parts, params);
    let actor = parts.extensions.get::<Actor>();
    if let Some(actor) = actor.filter(|actor| actor.role == Role::User) {
        request = request.with_user(actor.user_ref());
    }
    let mut ctx = EventContext::new(event, request);
    if let Some(actor) = actor {
        ctx = ctx.with_actor(actor.clone());
    }
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        ctx = ctx.with_client_ip(addr.ip());
    }
    ctx
}

fn aborted(err: &DispatchError) -> Response {
    failure(StatusCode::INTERNAL_SERVER_ERROR, err.message.clone())
}

fn log_audit(ctx: &EventContext) {
    for entry in &ctx.audit {
        info!(
            event = %entry.event,
            position = %entry.position,
            rule = %entry.rule,
            handler = %entry.handler,
            action = %entry.action,
            success = entry.success,
            info = %entry.info,
            "event rule executed"
        );
    }
}

/// Serialise the response snapshot, keeping the original headers.
fn render(snapshot: &ResponseSnapshot, mut headers: HeaderMap, original: Bytes) -> Response {
    let status = StatusCode::from_u16(snapshot.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match &snapshot.body {
        Some(body) => {
            headers.remove(header::CONTENT_LENGTH);
            (status, Json(body)).into_response()
        }
        None => (status, Body::from(original)).into_response(),
    };
    for (name, value) in &headers {
        if name != header::CONTENT_TYPE || snapshot.body.is_none() {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

/// Run the `post` rules against the status only and hand back the streamed response.
async fn passthrough(
    pipeline: &Pipeline,
    mut ctx: EventContext,
    parts: axum::http::response::Parts,
    body: Body,
) -> Response {
    ctx.response = Some(ResponseSnapshot {
        status: parts.status.as_u16(),
        body: None,
    });
    if let Err(err) = pipeline.engine.dispatch(&mut ctx, Position::Post).await {
        log_audit(&ctx);
        return aborted(&err);
    }
    log_audit(&ctx);

    match ctx.response {
        Some(snapshot) if snapshot.body.is_some() => {
            render(&snapshot, parts.headers, Bytes::new())
        }
        _ => Response::from_parts(parts, body),
    }
}

/// Run the rules of `event` around `next`.
pub async fn around(pipeline: &Pipeline, event: &str, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let mut body = match axum::body::to_bytes(body, pipeline.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(event, "Request body rejected: {err}");
            return failure(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let mut parsed = parse_request(&parts.uri, &parts.headers, &body);
    let before = parsed.params();
    let mut ctx = context(event, &parts, before.clone());

    if let Err(err) = pipeline.engine.dispatch(&mut ctx, Position::Pre).await {
        log_audit(&ctx);
        return aborted(&err);
    }

    let (snapshot, headers, original) = if let Some(remote) = ctx.response.clone() {
        debug!(event, "response provided by a pre rule");
        (remote, HeaderMap::new(), Bytes::new())
    } else {
        if ctx.request.params != before {
            parsed.apply(&before, &ctx.request.params);
            rewrite(&mut parts, &mut body, &parsed);
        }

        let response = next.run(Request::from_parts(parts, Body::from(body))).await;
        if !pipeline.engine.has_rules(event, Position::Post).await {
            log_audit(&ctx);
            return response;
        }

        let (response_parts, response_body) = response.into_parts();
        let limit = u64::try_from(pipeline.max_body_bytes).unwrap_or(u64::MAX);
        if !response_body
            .size_hint()
            .upper()
            .is_some_and(|upper| upper <= limit)
        {
            debug!(event, "response too large to buffer, post rules see no body");
            return passthrough(pipeline, ctx, response_parts, response_body).await;
        }

        let bytes = match axum::body::to_bytes(response_body, pipeline.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(event, "Response body unreadable: {err}");
                return failure(StatusCode::BAD_GATEWAY, "response body unreadable");
            }
        };
        let body = if is_json(&response_parts.headers) {
            serde_json::from_slice::<Value>(&bytes).ok()
        } else {
            None
        };
        (
            ResponseSnapshot {
                status: response_parts.status.as_u16(),
                body,
            },
            response_parts.headers,
            bytes,
        )
    };

    ctx.response = Some(snapshot);
    if let Err(err) = pipeline.engine.dispatch(&mut ctx, Position::Post).await {
        log_audit(&ctx);
        return aborted(&err);
    }
    log_audit(&ctx);

    match &ctx.response {
        Some(snapshot) => render(snapshot, headers, original),
        None => failure(StatusCode::INTERNAL_SERVER_ERROR, "response dropped by event rules"),
    }
}

/// Route layer: hooks requests whose route appears in `HOOKED_ROUTES`.
pub async fn hook(pipeline: Extension<Arc<Pipeline>>, request: Request, next: Next) -> Response {
    let event = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|route| event_for(request.method(), route.as_str()));
    match event {
        Some(event) => around(&pipeline, event, request, next).await,
        None => next.run(request).await,
    }
}
