use crate::events::compare::{parse_timestamp, substitute_now};
use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::store::{Token, TokenMutation};
use crate::events::template::Tags;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const NAME: &str = "token";

pub const ACTION_SET_TOKENREALM: &str = "set_tokenrealm";
pub const ACTION_DELETE: &str = "delete";
pub const ACTION_UNASSIGN: &str = "unassign";
pub const ACTION_DISABLE: &str = "disable";
pub const ACTION_ENABLE: &str = "enable";
pub const ACTION_ENROLL: &str = "enroll";
pub const ACTION_SET_DESCRIPTION: &str = "set_description";
pub const ACTION_SET_VALIDITY: &str = "set_validity";
pub const ACTION_SET_COUNTWINDOW: &str = "set_countwindow";
pub const ACTION_SET_TOKENINFO: &str = "set_tokeninfo";
pub const ACTION_DELETE_TOKENINFO: &str = "delete_tokeninfo";
pub const ACTION_SET_FAILCOUNTER: &str = "set_failcounter";
pub const ACTION_CHANGE_FAILCOUNTER: &str = "change_failcounter";
pub const ACTION_ADD_TOKENGROUP: &str = "add_tokengroup";
pub const ACTION_REMOVE_TOKENGROUP: &str = "remove_tokengroup";

const ENROLL_TYPES: &[&str] = &["hotp", "totp", "email", "sms", "registration", "spass"];

/// Mutates the token the request resolved to, or enrolls a new one for the user.
#[derive(Debug, Default)]
pub struct TokenHandler;

fn serial_prefix(tokentype: &str) -> String {
    match tokentype {
        "hotp" => "OATH".to_string(),
        "totp" => "TOTP".to_string(),
        "email" => "PIEM".to_string(),
        "sms" => "PISM".to_string(),
        "registration" => "REG".to_string(),
        "spass" => "PISP".to_string(),
        other => other.chars().take(4).collect::<String>().to_ascii_uppercase(),
    }
}

fn new_serial(tokentype: &str) -> String {
    format!("{}{:08X}", serial_prefix(tokentype), rand::thread_rng().r#gen::<u32>())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse an optional date option after `{now}` substitution; empty means unset.
fn date_option(options: &ActionOptions, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    match options.text(name) {
        None => Ok(None),
        Some(raw) => {
            let resolved = substitute_now(raw, Utc::now());
            parse_timestamp(&resolved)
                .map(Some)
                .ok_or_else(|| format!("{name}: {resolved} is not a date"))
        }
    }
}

impl TokenHandler {
    fn mutation(
        action: &str,
        options: &ActionOptions,
        ctx: &ActionContext<'_>,
    ) -> Result<TokenMutation, String> {
        let text = |name: &str| options.text(name).unwrap_or_default().to_string();
        let int = |name: &str| {
            options
                .int(name)
                .ok_or_else(|| format!("option {name} is required"))
        };
        Ok(match action {
            ACTION_SET_TOKENREALM => {
                let realms = split_list(&text("realms"));
                if options.bool("only_add_to_realm") {
                    return realms
                        .into_iter()
                        .next()
                        .map(TokenMutation::AddRealm)
                        .ok_or_else(|| "no realm given".to_string());
                }
                TokenMutation::SetRealms(realms)
            }
            ACTION_UNASSIGN => TokenMutation::Unassign,
            ACTION_DISABLE => TokenMutation::SetActive(false),
            ACTION_ENABLE => TokenMutation::SetActive(true),
            ACTION_SET_DESCRIPTION => {
                let tags = Tags::collect(&*ctx.event, ctx.subject, Utc::now());
                TokenMutation::SetDescription(substitute_now(
                    &tags.render(&text("description")),
                    Utc::now(),
                ))
            }
            ACTION_SET_VALIDITY => TokenMutation::SetValidity {
                start: date_option(options, "validity_period_start")?,
                end: date_option(options, "validity_period_end")?,
            },
            ACTION_SET_COUNTWINDOW => TokenMutation::SetCountWindow(int("count window")?),
            ACTION_SET_TOKENINFO => TokenMutation::SetInfo {
                key: text("key"),
                value: substitute_now(&text("value"), Utc::now()),
            },
            ACTION_DELETE_TOKENINFO => TokenMutation::DeleteInfo(text("key")),
            ACTION_SET_FAILCOUNTER => TokenMutation::SetFailCount(int("fail counter")?),
            ACTION_CHANGE_FAILCOUNTER => {
                TokenMutation::ChangeFailCount(int("change fail counter")?)
            }
            ACTION_ADD_TOKENGROUP => TokenMutation::AddGroup(text("tokengroup")),
            ACTION_REMOVE_TOKENGROUP => TokenMutation::RemoveGroup(text("tokengroup")),
            other => return Err(format!("unknown action {other}")),
        })
    }

    async fn enroll(
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let Some(user) = ctx.subject.user_ref.clone() else {
            warn!(rule = ctx.rule, "No user to enroll a token for");
            return Ok(false);
        };
        let tokentype = options.text("tokentype").unwrap_or("hotp");
        let mut token = Token::new(new_serial(tokentype), tokentype);
        token.realms = vec![user.realm.clone()];
        token.owner = Some(user);
        if let Some(description) = options.text("description") {
            token.description = substitute_now(description, Utc::now());
        }
        let serial = token.serial.clone();
        ctx.services.tokens.create_token(token).await?;
        info!(rule = ctx.rule, serial, tokentype, "token enrolled");
        Ok(true)
    }
}

#[async_trait]
impl ActionHandler for TokenHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Change the state of the token involved in the request"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        let tokengroup = || {
            vec![
                OptionSpec::new("tokengroup", OptionKind::Text, "Name of the token group")
                    .required(),
            ]
        };
        BTreeMap::from([
            (
                ACTION_SET_TOKENREALM.to_string(),
                vec![
                    OptionSpec::new("realms", OptionKind::Text, "Comma separated realms")
                        .required(),
                    OptionSpec::new(
                        "only_add_to_realm",
                        OptionKind::Bool,
                        "Add the first realm instead of replacing all realms",
                    ),
                ],
            ),
            (ACTION_DELETE.to_string(), Vec::new()),
            (ACTION_UNASSIGN.to_string(), Vec::new()),
            (ACTION_DISABLE.to_string(), Vec::new()),
            (ACTION_ENABLE.to_string(), Vec::new()),
            (
                ACTION_ENROLL.to_string(),
                vec![
                    OptionSpec::new(
                        "tokentype",
                        OptionKind::Choice(ENROLL_TYPES),
                        "Type of the new token",
                    )
                    .with_default("hotp"),
                    OptionSpec::new(
                        "description",
                        OptionKind::Text,
                        "Description of the new token",
                    ),
                ],
            ),
            (
                ACTION_SET_DESCRIPTION.to_string(),
                vec![
                    OptionSpec::new(
                        "description",
                        OptionKind::Text,
                        "Description; accepts {tags} and {now}+Nd",
                    )
                    .required(),
                ],
            ),
            (
                ACTION_SET_VALIDITY.to_string(),
                vec![
                    OptionSpec::new(
                        "validity_period_start",
                        OptionKind::Text,
                        "Start date or {now}+Nd",
                    ),
                    OptionSpec::new(
                        "validity_period_end",
                        OptionKind::Text,
                        "End date or {now}+Nd",
                    ),
                ],
            ),
            (
                ACTION_SET_COUNTWINDOW.to_string(),
                vec![
                    OptionSpec::new("count window", OptionKind::Int, "New count window")
                        .required(),
                ],
            ),
            (
                ACTION_SET_TOKENINFO.to_string(),
                vec![
                    OptionSpec::new("key", OptionKind::Text, "Tokeninfo key").required(),
                    OptionSpec::new("value", OptionKind::Text, "Value; accepts {now}+Nd"),
                ],
            ),
            (
                ACTION_DELETE_TOKENINFO.to_string(),
                vec![OptionSpec::new("key", OptionKind::Text, "Tokeninfo key").required()],
            ),
            (
                ACTION_SET_FAILCOUNTER.to_string(),
                vec![
                    OptionSpec::new("fail counter", OptionKind::Int, "New fail counter")
                        .required(),
                ],
            ),
            (
                ACTION_CHANGE_FAILCOUNTER.to_string(),
                vec![
                    OptionSpec::new(
                        "change fail counter",
                        OptionKind::Int,
                        "Relative change like -1 or 2",
                    )
                    .required(),
                ],
            ),
            (ACTION_ADD_TOKENGROUP.to_string(), tokengroup()),
            (ACTION_REMOVE_TOKENGROUP.to_string(), tokengroup()),
        ])
    }

    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        if action == ACTION_ENROLL {
            return Self::enroll(options, ctx).await;
        }

        let Some(serial) = ctx.subject.token.as_ref().map(|token| token.serial.clone()) else {
            warn!(rule = ctx.rule, action, "No single token resolved, nothing to change");
            return Ok(false);
        };

        if action == ACTION_DELETE {
            ctx.services.tokens.delete_token(&serial).await?;
            info!(rule = ctx.rule, serial, "token deleted");
            return Ok(true);
        }

        let mutation = match Self::mutation(action, options, ctx) {
            Ok(mutation) => mutation,
            Err(err) => {
                warn!(rule = ctx.rule, serial, "{err}");
                return Ok(false);
            }
        };
        ctx.services.tokens.update_token(&serial, mutation).await?;
        info!(rule = ctx.rule, serial, action, "token updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_carry_type_prefix() {
        let serial = new_serial("hotp");
        assert!(serial.starts_with("OATH"));
        assert_eq!(serial.len(), 12);
        assert!(new_serial("yubikey").starts_with("YUBI"));
    }

    #[test]
    fn realm_lists_split_on_commas_and_spaces() {
        assert_eq!(split_list("a, b c,,"), vec!["a", "b", "c"]);
    }
}
