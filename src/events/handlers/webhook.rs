use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::template::Tags;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use url::Url;

pub const NAME: &str = "webhook";
pub const ACTION_POST: &str = "post_webhook";

pub const CONTENT_JSON: &str = "json";
pub const CONTENT_URLENCODED: &str = "urlencoded";

/// POSTs a templated payload to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    client: Client,
}

impl WebhookHandler {
    /// `client` must carry the outbound timeout; failures never leave the handler.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Encode `data` for `content_type`. Tags are substituted after parsing, inside each
    /// value, so substituted text is always escaped by the encoder.
    fn body(
        content_type: &str,
        data: &str,
        tags: Option<&Tags>,
    ) -> Result<(String, &'static str), String> {
        let render = |text: &str| tags.map_or_else(|| text.to_string(), |tags| tags.render(text));

        if content_type == CONTENT_URLENCODED {
            let pairs: BTreeMap<String, String> = match serde_json::from_str::<Value>(data) {
                Ok(Value::Object(map)) => map
                    .into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::String(text) => render(&text),
                            other => other.to_string(),
                        };
                        (key, value)
                    })
                    .collect(),
                Ok(_) => return Err("urlencoded data must be a JSON object".to_string()),
                Err(_) => url::form_urlencoded::parse(data.as_bytes())
                    .map(|(key, value)| (key.into_owned(), render(&value)))
                    .collect(),
            };
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            return Ok((encoded, "application/x-www-form-urlencoded"));
        }

        let mut value = serde_json::from_str::<Value>(data)
            .map_err(|err| format!("data is not valid JSON: {err}"))?;
        if let Some(tags) = tags {
            render_strings(&mut value, tags);
        }
        Ok((value.to_string(), "application/json"))
    }
}

/// Substitute tags in every string of a JSON document.
fn render_strings(value: &mut Value, tags: &Tags) {
    match value {
        Value::String(text) => *text = tags.render(text),
        Value::Array(items) => items.iter_mut().for_each(|item| render_strings(item, tags)),
        Value::Object(map) => map.values_mut().for_each(|item| render_strings(item, tags)),
        _ => {}
    }
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Send a POST request to an external endpoint"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        BTreeMap::from([(
            ACTION_POST.to_string(),
            vec![
                OptionSpec::new("URL", OptionKind::Text, "Target URL").required(),
                OptionSpec::new(
                    "content_type",
                    OptionKind::Choice(&[CONTENT_JSON, CONTENT_URLENCODED]),
                    "Payload encoding",
                )
                .with_default(CONTENT_JSON),
                OptionSpec::new("replace", OptionKind::Bool, "Substitute {tags} in the payload"),
                OptionSpec::new("data", OptionKind::Text, "Payload, a JSON document")
                    .with_default("{}"),
            ],
        )])
    }

    async fn execute(
        &self,
        _action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let Some(url) = options.text("URL").and_then(|url| Url::parse(url).ok()) else {
            warn!(rule = ctx.rule, "Webhook URL missing or invalid");
            return Ok(false);
        };

        let data = options.text("data").unwrap_or("{}");
        let tags = options
            .bool("replace")
            .then(|| Tags::collect(ctx.event, ctx.subject, Utc::now()));

        let content_type = options.text("content_type").unwrap_or(CONTENT_JSON);
        let (body, mime) = match Self::body(content_type, data, tags.as_ref()) {
            Ok(body) => body,
            Err(err) => {
                warn!(rule = ctx.rule, "Webhook payload rejected: {err}");
                return Ok(false);
            }
        };

        match self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, mime)
            .body(body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(rule = ctx.rule, %url, status = %response.status(), "webhook delivered");
                Ok(true)
            }
            Ok(response) => {
                warn!(rule = ctx.rule, %url, status = %response.status(), "webhook rejected");
                Ok(false)
            }
            Err(err) => {
                warn!(rule = ctx.rule, %url, "webhook failed: {err}");
                Ok(false)
            }
        }
    }
}
