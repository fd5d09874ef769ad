//! Per-request view the engine evaluates rules against.

use crate::events::rule::Position;
use crate::events::store::UserRef;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Authenticated role of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logged-in administrator or user issuing the request.
///
/// Inserted into request extensions by the authentication layer in front of the hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub realm: String,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn user_ref(&self) -> UserRef {
        UserRef::new(&self.username, &self.realm)
    }
}

/// Inbound call as seen by the engine. Parameters are mutable so the request mangler
/// can rewrite them before the core action runs.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub user: Option<UserRef>,
    pub authorization: Option<SecretString>,
}

impl RequestSnapshot {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: UserRef) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Structured result of the core action. `body` is `None` when the response was not JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub body: Option<Value>,
}

impl ResponseSnapshot {
    #[must_use]
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    /// Walk nested object keys, e.g. `["result", "value"]`.
    #[must_use]
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut current = self.body.as_ref()?;
        for key in path {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    #[must_use]
    pub fn lookup_str(&self, path: &[&str]) -> Option<&str> {
        self.lookup(path).and_then(Value::as_str)
    }
}

/// Informational entry appended to the audit trail by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub event: String,
    pub position: Position,
    pub rule: String,
    pub handler: String,
    pub action: String,
    pub success: bool,
    pub info: String,
}

/// Everything one dispatch sees and may mutate.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event: String,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub actor: Option<Actor>,
    pub client_ip: Option<IpAddr>,
    pub audit: Vec<AuditEntry>,
}

impl EventContext {
    #[must_use]
    pub fn new(event: impl Into<String>, request: RequestSnapshot) -> Self {
        Self {
            event: event.into(),
            request,
            response: None,
            actor: None,
            client_ip: None,
            audit: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self
    }

    /// Serial named by the request, falling back to `detail.serial` of the response.
    #[must_use]
    pub fn serial(&self) -> Option<String> {
        self.request
            .param("serial")
            .filter(|serial| !serial.is_empty())
            .map(ToString::to_string)
            .or_else(|| {
                self.response
                    .as_ref()
                    .and_then(|response| response.lookup_str(&["detail", "serial"]))
                    .filter(|serial| !serial.is_empty())
                    .map(ToString::to_string)
            })
    }

    /// User the request is about: the resolved request user, else `user`/`realm` params.
    #[must_use]
    pub fn request_user(&self) -> Option<UserRef> {
        if let Some(user) = &self.request.user {
            return Some(user.clone());
        }
        let login = self.request.param("user").filter(|login| !login.is_empty())?;
        let realm = self.request.param("realm").unwrap_or_default();
        Some(UserRef::new(login, realm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serial_prefers_request_then_response() {
        let request = RequestSnapshot::new("POST", "/validate/check").with_param("serial", "OATH1");
        let ctx = EventContext::new("validate_check", request).with_response(
            ResponseSnapshot::json(200, json!({"detail": {"serial": "OATH2"}})),
        );
        assert_eq!(ctx.serial().as_deref(), Some("OATH1"));

        let ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"))
            .with_response(ResponseSnapshot::json(200, json!({"detail": {"serial": "OATH2"}})));
        assert_eq!(ctx.serial().as_deref(), Some("OATH2"));

        let ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"));
        assert_eq!(ctx.serial(), None);
    }

    #[test]
    fn request_user_from_params() {
        let request = RequestSnapshot::new("POST", "/")
            .with_param("user", "alice")
            .with_param("realm", "wonderland");
        let ctx = EventContext::new("validate_check", request);
        assert_eq!(ctx.request_user(), Some(UserRef::new("alice", "wonderland")));
    }

    #[test]
    fn response_lookup() {
        let response = ResponseSnapshot::json(200, json!({"result": {"value": false}}));
        assert_eq!(response.lookup(&["result", "value"]), Some(&json!(false)));
        assert_eq!(response.lookup(&["result", "missing"]), None);
        let text = ResponseSnapshot {
            status: 200,
            body: None,
        };
        assert_eq!(text.lookup(&["result"]), None);
    }
}
