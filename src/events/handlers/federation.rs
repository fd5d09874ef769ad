//! Replays the current request against a remote server and adopts its answer.
//!
//! Used at `pre` the remote response replaces the core action; at `post` it replaces the
//! local result. Either way `detail.origin` names the server that produced it.

use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::context::ResponseSnapshot;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};
use url::Url;

pub const NAME: &str = "federation";
pub const ACTION_FORWARD: &str = "forward";

#[derive(Debug, Clone)]
pub struct FederationHandler {
    client: Client,
    remotes: BTreeMap<String, Url>,
}

impl FederationHandler {
    #[must_use]
    pub fn new(client: Client, remotes: BTreeMap<String, Url>) -> Self {
        Self { client, remotes }
    }

    fn target(base: &Url, path: &str) -> Result<Url, url::ParseError> {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(path.trim_start_matches('/'))
    }
}

/// Insert `detail.origin`, creating `detail` when the remote did not send one.
fn mark_origin(body: &mut Value, origin: &str) {
    if let Some(object) = body.as_object_mut() {
        let detail = object
            .entry("detail")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(detail) = detail.as_object_mut() {
            detail.insert("origin".to_string(), Value::String(origin.to_string()));
        }
    }
}

#[async_trait]
impl ActionHandler for FederationHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Forward the request to another authentication server"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        BTreeMap::from([(
            ACTION_FORWARD.to_string(),
            vec![
                OptionSpec::new("remote", OptionKind::Text, "Name of the remote server").required(),
                OptionSpec::new("realm", OptionKind::Text, "Realm to use on the remote server"),
                OptionSpec::new("resolver", OptionKind::Text, "Resolver to use on the remote server"),
                OptionSpec::new(
                    "forward_client_ip",
                    OptionKind::Bool,
                    "Send the original client IP as the client parameter",
                ),
                OptionSpec::new(
                    "forward_authorization_token",
                    OptionKind::Bool,
                    "Send the caller's Authorization header",
                ),
            ],
        )])
    }

    async fn execute(
        &self,
        _action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let remote = options.text("remote").unwrap_or_default();
        let Some(base) = self.remotes.get(remote) else {
            warn!(rule = ctx.rule, remote, "Unknown remote server");
            return Ok(false);
        };

        let method = match ctx.event.request.method.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "DELETE" => Method::DELETE,
            other => {
                warn!(rule = ctx.rule, method = other, "Method cannot be forwarded");
                return Ok(false);
            }
        };

        let url = match Self::target(base, &ctx.event.request.path) {
            Ok(url) => url,
            Err(err) => {
                warn!(rule = ctx.rule, remote, "Invalid forward URL: {err}");
                return Ok(false);
            }
        };

        let mut params = ctx.event.request.params.clone();
        if let Some(realm) = options.text("realm") {
            params.insert("realm".to_string(), realm.to_string());
        }
        if let Some(resolver) = options.text("resolver") {
            params.insert("resolver".to_string(), resolver.to_string());
        }
        if options.bool("forward_client_ip")
            && let Some(ip) = ctx.event.client_ip
        {
            params.insert("client".to_string(), ip.to_string());
        }

        let mut request = if method == Method::POST {
            self.client.post(url.clone()).form(&params)
        } else {
            self.client.request(method, url.clone()).query(&params)
        };
        if options.bool("forward_authorization_token")
            && let Some(token) = &ctx.event.request.authorization
        {
            request = request.header(AUTHORIZATION, token.expose_secret());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(rule = ctx.rule, %url, "Forwarding failed: {err}");
                return Ok(false);
            }
        };
        let status = response.status().as_u16();
        let mut body = match response.json::<Value>().await {
            Ok(body) => body,
            Err(err) => {
                warn!(rule = ctx.rule, %url, "Remote answer is not JSON: {err}");
                return Ok(false);
            }
        };

        mark_origin(&mut body, url.as_str());
        info!(rule = ctx.rule, %url, status, "request forwarded");
        ctx.event.response = Some(ResponseSnapshot::json(status, body));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_keeps_base_path() -> Result<(), url::ParseError> {
        let base = Url::parse("https://remote.example/api")?;
        assert_eq!(
            FederationHandler::target(&base, "/validate/check")?.as_str(),
            "https://remote.example/api/validate/check"
        );
        Ok(())
    }

    #[test]
    fn origin_is_added_to_detail() {
        let mut body = json!({"result": {"value": true}});
        mark_origin(&mut body, "https://remote.example/validate/check");
        assert_eq!(body["detail"]["origin"], json!("https://remote.example/validate/check"));
    }
}
