use crate::events::compare::is_true;
use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::rule::Position;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const NAME: &str = "responsemangler";
pub const ACTION_DELETE: &str = "delete";
pub const ACTION_SET: &str = "set";

pub const MAX_DEPTH: usize = 3;

/// Rewrites the JSON response body after the core action.
#[derive(Debug, Default)]
pub struct ResponseManglerHandler;

/// Split `/a/b/c` into its components, rejecting empty or too deep paths.
fn split_pointer(path: &str) -> Result<Vec<String>, String> {
    let components: Vec<String> = path
        .trim()
        .trim_start_matches('/')
        .split('/')
        .map(|component| component.replace("~1", "/").replace("~0", "~"))
        .collect();
    if components.iter().any(String::is_empty) {
        return Err(format!("invalid JSON pointer {path}"));
    }
    if components.len() > MAX_DEPTH {
        return Err(format!("JSON pointer {path} is deeper than {MAX_DEPTH}"));
    }
    Ok(components)
}

fn coerce(value: &str, kind: &str) -> Result<Value, String> {
    match kind {
        "integer" => value
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|err| format!("{value} is not an integer: {err}")),
        "bool" => Ok(Value::Bool(is_true(value))),
        _ => Ok(Value::String(value.to_string())),
    }
}

/// Remove the value at `components`; a missing path is not an error.
fn delete_at(body: &mut Value, components: &[String]) {
    let Some((last, parents)) = components.split_last() else {
        return;
    };
    let mut current = body;
    for key in parents {
        match current.get_mut(key.as_str()) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(object) = current.as_object_mut() {
        object.remove(last.as_str());
    }
}

/// Set the value at `components`, creating missing intermediate objects.
fn set_at(body: &mut Value, components: &[String], value: Value) -> Result<(), String> {
    let Some((last, parents)) = components.split_last() else {
        return Err("empty JSON pointer".to_string());
    };
    let mut current = body;
    for key in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| format!("{key} is below a non-object value"))?;
        current = object
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| format!("{last} is below a non-object value"))?
        .insert(last.clone(), value);
    Ok(())
}

#[async_trait]
impl ActionHandler for ResponseManglerHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Modify the JSON response of the request"
    }

    fn allowed_positions(&self) -> &'static [Position] {
        &[Position::Post]
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        let path = OptionSpec::new("JSON pointer", OptionKind::Text, "Path like /detail/message")
            .required();
        BTreeMap::from([
            (ACTION_DELETE.to_string(), vec![path.clone()]),
            (
                ACTION_SET.to_string(),
                vec![
                    path,
                    OptionSpec::new("value", OptionKind::Text, "Value to set").required(),
                    OptionSpec::new(
                        "type",
                        OptionKind::Choice(&["string", "integer", "bool"]),
                        "Type of the value",
                    )
                    .with_default("string"),
                ],
            ),
        ])
    }

    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let Some(body) = ctx
            .event
            .response
            .as_mut()
            .and_then(|response| response.body.as_mut())
            .filter(|body| body.is_object())
        else {
            warn!(rule = ctx.rule, "Response is not a JSON object, nothing to mangle");
            return Ok(false);
        };

        let components = match split_pointer(options.text("JSON pointer").unwrap_or_default()) {
            Ok(components) => components,
            Err(err) => {
                warn!(rule = ctx.rule, "{err}");
                return Ok(false);
            }
        };

        let result = match action {
            ACTION_DELETE => {
                delete_at(body, &components);
                Ok(())
            }
            ACTION_SET => coerce(
                options.text("value").unwrap_or_default(),
                options.text("type").unwrap_or("string"),
            )
            .and_then(|value| set_at(body, &components, value)),
            other => Err(format!("unknown action {other}")),
        };

        match result {
            Ok(()) => {
                debug!(rule = ctx.rule, action, path = components.join("/"), "response mangled");
                Ok(true)
            }
            Err(err) => {
                warn!(rule = ctx.rule, "{err}");
                Ok(false)
            }
        }
    }
}
