use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const NAME: &str = "requestmangler";
pub const ACTION_DELETE: &str = "delete";
pub const ACTION_SET: &str = "set";

static GROUP_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\{(\d+)\}").ok());

/// Rewrites request parameters before (or after) the core action.
#[derive(Debug, Default)]
pub struct RequestManglerHandler;

/// Fill `{0}`, `{1}`, ... with capture groups; `None` if a group index does not exist.
fn fill_groups(template: &str, groups: &[String]) -> Option<String> {
    let pattern = GROUP_PATTERN.as_ref()?;
    let mut missing = false;
    let filled = pattern.replace_all(template, |captures: &Captures<'_>| {
        match captures[1].parse::<usize>().ok().and_then(|index| groups.get(index)) {
            Some(group) => group.clone(),
            None => {
                missing = true;
                String::new()
            }
        }
    });
    (!missing).then(|| filled.into_owned())
}

/// Derive the new value from `match_parameter` when a pattern is configured.
fn derive_value(
    template: &str,
    source: Option<&str>,
    match_pattern: &str,
) -> Result<Option<String>, String> {
    let Some(source) = source else {
        return Ok(None);
    };
    let pattern = Regex::new(&format!("^(?:{match_pattern})"))
        .map_err(|err| format!("invalid match_pattern: {err}"))?;
    let Some(captures) = pattern.captures(source) else {
        return Ok(None);
    };
    let groups: Vec<String> = captures
        .iter()
        .skip(1)
        .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();
    fill_groups(template, &groups)
        .map(Some)
        .ok_or_else(|| format!("value template {template} references a missing group"))
}

#[async_trait]
impl ActionHandler for RequestManglerHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Modify the parameters of the incoming request"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        BTreeMap::from([
            (
                ACTION_DELETE.to_string(),
                vec![
                    OptionSpec::new("parameter", OptionKind::Text, "Parameter to remove")
                        .required(),
                ],
            ),
            (
                ACTION_SET.to_string(),
                vec![
                    OptionSpec::new("parameter", OptionKind::Text, "Parameter to set").required(),
                    OptionSpec::new(
                        "value",
                        OptionKind::Text,
                        "New value; {0}, {1}... take groups of match_pattern",
                    )
                    .required(),
                    OptionSpec::new(
                        "match_parameter",
                        OptionKind::Text,
                        "Parameter the pattern is matched against",
                    ),
                    OptionSpec::new("match_pattern", OptionKind::Text, "Regular expression"),
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
        let Some(parameter) = options.text("parameter") else {
            return Ok(false);
        };
        let params = &mut ctx.event.request.params;

        match action {
            ACTION_DELETE => {
                params.remove(parameter);
                debug!(rule = ctx.rule, parameter, "request parameter removed");
                Ok(true)
            }
            ACTION_SET => {
                let template = options.text("value").unwrap_or_default();
                let value = match (options.text("match_parameter"), options.text("match_pattern")) {
                    (Some(source), Some(pattern)) => {
                        match derive_value(template, params.get(source).map(String::as_str), pattern)
                        {
                            Ok(Some(value)) => value,
                            Ok(None) => {
                                debug!(rule = ctx.rule, parameter, "match_pattern did not match");
                                return Ok(true);
                            }
                            Err(err) => {
                                warn!(rule = ctx.rule, parameter, "{err}");
                                return Ok(false);
                            }
                        }
                    }
                    _ => template.to_string(),
                };
                params.insert(parameter.to_string(), value);
                debug!(rule = ctx.rule, parameter, "request parameter set");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_fill_template() {
        assert_eq!(
            derive_value("{0}@{1}", Some("alice.wonderland"), r"(\w+)\.(\w+)"),
            Ok(Some("alice@wonderland".to_string()))
        );
    }

    #[test]
    fn pattern_is_anchored_at_start() {
        assert_eq!(derive_value("{0}", Some("xalice"), "(alice)"), Ok(None));
    }

    #[test]
    fn malformed_inputs_are_reported() {
        assert!(derive_value("{0}", Some("alice"), "(").is_err());
        assert!(derive_value("{3}", Some("alice"), "(alice)").is_err());
        assert_eq!(derive_value("{0}", None, "(alice)"), Ok(None));
    }
}
