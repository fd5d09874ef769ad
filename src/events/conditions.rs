//! Condition evaluator.
//!
//! A rule's conditions map a known key to a string expression. Every present key must hold
//! for the rule to fire; absent keys do not constrain. Token-scoped conditions only match
//! when exactly one token was resolved for the request, `token_locked` excepted: without a
//! single token it looks at every token of the user.

use crate::events::compare::{self, compare_condition, compare_values, is_true};
use crate::events::context::EventContext;
use crate::events::store::{CounterStore, Token};
use crate::events::subject::Subject;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, warn};

pub const CLIENT_IP: &str = "client_ip";
pub const REALM: &str = "realm";
pub const RESOLVER: &str = "resolver";
pub const LOGGED_IN_USER: &str = "logged_in_user";
pub const RESULT_VALUE: &str = "result_value";
pub const RESULT_STATUS: &str = "result_status";
pub const RESULT_AUTHENTICATION: &str = "result_authentication";
pub const DETAIL_MESSAGE: &str = "detail_message";
pub const DETAIL_ERROR_MESSAGE: &str = "detail_error_message";
pub const SERIAL: &str = "serial";
pub const USER_TOKEN_NUMBER: &str = "user_token_number";
pub const USERINFO: &str = "userinfo";
pub const COUNTER: &str = "counter";
pub const TOKEN_LOCKED: &str = "token_locked";
pub const TOKENREALM: &str = "tokenrealm";
pub const TOKENRESOLVER: &str = "tokenresolver";
pub const TOKENTYPE: &str = "tokentype";
pub const TOKEN_HAS_OWNER: &str = "token_has_owner";
pub const TOKEN_IS_ORPHANED: &str = "token_is_orphaned";
pub const TOKEN_VALIDITY_PERIOD: &str = "token_validity_period";
pub const ROLLOUT_STATE: &str = "rollout_state";
pub const TOKENINFO: &str = "tokeninfo";
pub const FAILCOUNTER: &str = "failcounter";
pub const COUNT_AUTH: &str = "count_auth";
pub const COUNT_AUTH_SUCCESS: &str = "count_auth_success";
pub const COUNT_AUTH_FAIL: &str = "count_auth_fail";
pub const OTP_COUNTER: &str = "otp_counter";
pub const LAST_AUTH: &str = "last_auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Bool,
    Text,
    List,
    Regex,
    Comparator,
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionGroup {
    Request,
    Response,
    User,
    Token,
    Counter,
}

/// Metadata for one condition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionSpec {
    pub key: &'static str,
    pub kind: ConditionKind,
    pub group: ConditionGroup,
    pub description: &'static str,
}

const fn spec(
    key: &'static str,
    kind: ConditionKind,
    group: ConditionGroup,
    description: &'static str,
) -> ConditionSpec {
    ConditionSpec {
        key,
        kind,
        group,
        description,
    }
}

/// Known conditions in evaluation order.
pub const CONDITIONS: &[ConditionSpec] = &[
    spec(CLIENT_IP, ConditionKind::List, ConditionGroup::Request, "Client IP is in the networks, e.g. 10.0.0.0/8, !10.0.0.1"),
    spec(REALM, ConditionKind::List, ConditionGroup::User, "User is in one of these realms"),
    spec(RESOLVER, ConditionKind::List, ConditionGroup::User, "User is in one of these resolvers"),
    spec(LOGGED_IN_USER, ConditionKind::Text, ConditionGroup::Request, "Role of the logged-in caller: admin or user"),
    spec(RESULT_VALUE, ConditionKind::Bool, ConditionGroup::Response, "result.value of the response"),
    spec(RESULT_STATUS, ConditionKind::Bool, ConditionGroup::Response, "result.status of the response"),
    spec(RESULT_AUTHENTICATION, ConditionKind::Text, ConditionGroup::Response, "result.authentication of the response, e.g. ACCEPT"),
    spec(DETAIL_MESSAGE, ConditionKind::Regex, ConditionGroup::Response, "Regex searched in detail.message"),
    spec(DETAIL_ERROR_MESSAGE, ConditionKind::Regex, ConditionGroup::Response, "Regex searched in result.error.message"),
    spec(SERIAL, ConditionKind::Regex, ConditionGroup::Request, "Regex matched at the start of the serial"),
    spec(USER_TOKEN_NUMBER, ConditionKind::Comparator, ConditionGroup::User, "Exact number of tokens of the user"),
    spec(USERINFO, ConditionKind::Expression, ConditionGroup::User, "User attribute comparison, e.g. department==sales"),
    spec(COUNTER, ConditionKind::Expression, ConditionGroup::Counter, "Event counter comparison, e.g. failed_logins>10"),
    spec(TOKEN_LOCKED, ConditionKind::Bool, ConditionGroup::Token, "Token reached its maximum fail counter"),
    spec(TOKENREALM, ConditionKind::List, ConditionGroup::Token, "Token is in one of these realms"),
    spec(TOKENRESOLVER, ConditionKind::List, ConditionGroup::Token, "Token owner is in one of these resolvers"),
    spec(TOKENTYPE, ConditionKind::List, ConditionGroup::Token, "Token is of one of these types"),
    spec(TOKEN_HAS_OWNER, ConditionKind::Bool, ConditionGroup::Token, "Token is assigned to a user"),
    spec(TOKEN_IS_ORPHANED, ConditionKind::Bool, ConditionGroup::Token, "Token owner no longer exists"),
    spec(TOKEN_VALIDITY_PERIOD, ConditionKind::Bool, ConditionGroup::Token, "Token is within its validity period"),
    spec(ROLLOUT_STATE, ConditionKind::Text, ConditionGroup::Token, "Rollout state of the token"),
    spec(TOKENINFO, ConditionKind::Expression, ConditionGroup::Token, "Tokeninfo comparison, e.g. expires<{now}+2d"),
    spec(FAILCOUNTER, ConditionKind::Comparator, ConditionGroup::Token, "Fail counter, e.g. >5"),
    spec(COUNT_AUTH, ConditionKind::Comparator, ConditionGroup::Token, "Number of authentications, e.g. >100"),
    spec(COUNT_AUTH_SUCCESS, ConditionKind::Comparator, ConditionGroup::Token, "Number of successful authentications"),
    spec(COUNT_AUTH_FAIL, ConditionKind::Comparator, ConditionGroup::Token, "Number of failed authentications"),
    spec(OTP_COUNTER, ConditionKind::Comparator, ConditionGroup::Token, "OTP counter of the token"),
    spec(LAST_AUTH, ConditionKind::Text, ConditionGroup::Token, "Last authentication is older than this offset, e.g. 30d"),
];

#[must_use]
pub fn condition_specs() -> Vec<ConditionSpec> {
    CONDITIONS.to_vec()
}

/// Evaluate a rule's conditions at the current time.
pub async fn matches(
    conditions: &BTreeMap<String, String>,
    ctx: &EventContext,
    subject: &Subject,
    counters: &dyn CounterStore,
) -> bool {
    matches_at(conditions, ctx, subject, counters, Utc::now()).await
}

/// Evaluate a rule's conditions at a given instant.
pub async fn matches_at(
    conditions: &BTreeMap<String, String>,
    ctx: &EventContext,
    subject: &Subject,
    counters: &dyn CounterStore,
    now: DateTime<Utc>,
) -> bool {
    if let Some(unknown) = conditions
        .keys()
        .find(|key| !CONDITIONS.iter().any(|spec| spec.key == key.as_str()))
    {
        warn!("Unknown condition {unknown:?}, rule does not match");
        return false;
    }

    for spec in CONDITIONS {
        let Some(expected) = conditions.get(spec.key) else {
            continue;
        };

        let holds = if spec.key == COUNTER {
            counter_holds(expected, counters).await
        } else {
            check(spec, expected, ctx, subject, now)
        };

        if !holds {
            debug!(condition = spec.key, expected = %expected, "condition not met");
            return false;
        }
    }

    true
}

fn check(
    spec: &ConditionSpec,
    expected: &str,
    ctx: &EventContext,
    subject: &Subject,
    now: DateTime<Utc>,
) -> bool {
    if spec.group == ConditionGroup::Token && spec.key != TOKEN_LOCKED {
        return subject
            .token
            .as_ref()
            .is_some_and(|token| token_holds(spec.key, expected, token, subject, now));
    }

    match spec.key {
        CLIENT_IP => ctx
            .client_ip
            .is_some_and(|ip| ip_in_networks(ip, expected)),
        REALM => subject
            .user_ref
            .as_ref()
            .is_some_and(|user| in_list(expected, &user.realm)),
        RESOLVER => subject
            .user
            .as_ref()
            .map(|user| user.resolver.as_str())
            .or_else(|| subject.user_ref.as_ref().map(|user| user.resolver.as_str()))
            .is_some_and(|resolver| in_list(expected, resolver)),
        LOGGED_IN_USER => ctx
            .actor
            .as_ref()
            .is_some_and(|actor| actor.role.as_str().eq_ignore_ascii_case(expected.trim())),
        RESULT_VALUE => response_bool(ctx, &["result", "value"])
            .is_some_and(|value| value == is_true(expected)),
        RESULT_STATUS => response_bool(ctx, &["result", "status"])
            .is_some_and(|value| value == is_true(expected)),
        RESULT_AUTHENTICATION => ctx
            .response
            .as_ref()
            .and_then(|response| response.lookup_str(&["result", "authentication"]))
            .is_some_and(|value| value.eq_ignore_ascii_case(expected.trim())),
        DETAIL_MESSAGE => regex_search(expected, response_text(ctx, &["detail", "message"])),
        DETAIL_ERROR_MESSAGE => {
            regex_search(expected, response_text(ctx, &["result", "error", "message"]))
        }
        SERIAL => ctx
            .serial()
            .is_some_and(|serial| regex_prefix_match(expected, &serial)),
        USER_TOKEN_NUMBER => {
            subject.user_ref.is_some()
                && i64::try_from(subject.user_tokens.len())
                    .is_ok_and(|count| compare_condition(expected, count))
        }
        USERINFO => subject
            .user
            .as_ref()
            .or(subject.token_owner.as_ref())
            .is_some_and(|user| {
                expression_holds(expected, now, |field| user.info(field).map(ToString::to_string))
            }),
        TOKEN_LOCKED => {
            let locked = match &subject.token {
                Some(token) => token.is_locked(),
                None => subject.user_tokens.iter().any(Token::is_locked),
            };
            locked == is_true(expected)
        }
        other => {
            warn!("Condition {other:?} has no evaluator");
            false
        }
    }
}

fn token_holds(
    key: &str,
    expected: &str,
    token: &Token,
    subject: &Subject,
    now: DateTime<Utc>,
) -> bool {
    match key {
        TOKENREALM => token.realms.iter().any(|realm| in_list(expected, realm)),
        TOKENRESOLVER => token
            .owner
            .as_ref()
            .is_some_and(|owner| in_list(expected, &owner.resolver)),
        TOKENTYPE => expected
            .split(',')
            .any(|tokentype| tokentype.trim().eq_ignore_ascii_case(&token.tokentype)),
        TOKEN_HAS_OWNER => token.owner.is_some() == is_true(expected),
        TOKEN_IS_ORPHANED => {
            let orphaned = token.owner.is_some() && subject.token_owner.is_none();
            orphaned == is_true(expected)
        }
        TOKEN_VALIDITY_PERIOD => token.in_validity_period(now) == is_true(expected),
        ROLLOUT_STATE => token.rollout_state == expected.trim(),
        TOKENINFO => expression_holds(expected, now, |field| token.info.get(field).cloned()),
        FAILCOUNTER => compare_condition(expected, token.fail_count),
        COUNT_AUTH => compare_condition(expected, token.count_auth()),
        COUNT_AUTH_SUCCESS => compare_condition(expected, token.count_auth_success()),
        COUNT_AUTH_FAIL => compare_condition(expected, token.count_auth_fail()),
        OTP_COUNTER => compare_condition(expected, token.otp_counter),
        LAST_AUTH => last_auth_older_than(expected, token, now),
        other => {
            warn!("Token condition {other:?} has no evaluator");
            false
        }
    }
}

/// Membership in a comma separated list.
fn in_list(list: &str, value: &str) -> bool {
    list.split(',').map(str::trim).any(|entry| entry == value)
}

/// `10.0.0.0/8, 192.168.1.1, !10.0.0.7`: the IP must be in a positive entry and in no
/// negated one.
fn ip_in_networks(ip: IpAddr, networks: &str) -> bool {
    let mut included = false;
    for entry in networks.split([',', ' ']).map(str::trim).filter(|e| !e.is_empty()) {
        let (negated, entry) = match entry.strip_prefix('!') {
            Some(entry) => (true, entry),
            None => (false, entry),
        };
        let network = match entry.parse::<IpNetwork>() {
            Ok(network) => network,
            Err(err) => {
                warn!("Invalid network {entry:?} in client_ip condition: {err}");
                continue;
            }
        };
        if network.contains(ip) {
            if negated {
                return false;
            }
            included = true;
        }
    }
    included
}

fn response_bool(ctx: &EventContext, path: &[&str]) -> Option<bool> {
    ctx.response
        .as_ref()
        .and_then(|response| response.lookup(path))
        .map(json_truthy)
}

fn response_text(ctx: &EventContext, path: &[&str]) -> Option<String> {
    ctx.response
        .as_ref()
        .and_then(|response| response.lookup(path))
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
}

/// Truthiness of a JSON value as the endpoints report it.
#[must_use]
pub fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => is_true(text),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("Invalid regex {pattern:?} in condition: {err}");
            None
        }
    }
}

/// Search anywhere in the text; a missing field searches the empty string.
fn regex_search(pattern: &str, text: Option<String>) -> bool {
    compile(pattern).is_some_and(|regex| regex.is_match(text.as_deref().unwrap_or_default()))
}

/// Anchored at the start only, so `OATH` matches `OATH123456`.
fn regex_prefix_match(pattern: &str, text: &str) -> bool {
    compile(&format!("^(?:{pattern})")).is_some_and(|regex| regex.is_match(text))
}

fn expression_holds<F>(expression: &str, now: DateTime<Utc>, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(parsed) = compare::parse_field_expression(expression) else {
        warn!("Malformed condition expression {expression:?}");
        return false;
    };
    lookup(&parsed.field)
        .is_some_and(|value| compare_values(&value, parsed.comparator, &parsed.literal, now))
}

async fn counter_holds(expression: &str, counters: &dyn CounterStore) -> bool {
    let Some(parsed) = compare::parse_field_expression(expression) else {
        warn!("Malformed counter condition {expression:?}");
        return false;
    };
    let Ok(limit) = parsed.literal.parse::<i64>() else {
        warn!("Counter condition {expression:?} needs an integer");
        return false;
    };
    match counters.read(&parsed.field).await {
        Ok(value) => compare_values(
            &value.to_string(),
            parsed.comparator,
            &limit.to_string(),
            Utc::now(),
        ),
        Err(err) => {
            warn!("Failed to read counter {}: {err}", parsed.field);
            false
        }
    }
}

fn last_auth_older_than(offset: &str, token: &Token, now: DateTime<Utc>) -> bool {
    let Some(offset) = compare::parse_time_offset(offset) else {
        warn!("Malformed last_auth offset {offset:?}");
        return false;
    };
    let Some(last_auth) = token.last_auth() else {
        return false;
    };
    now.checked_sub_signed(offset.abs())
        .is_some_and(|threshold| last_auth < threshold)
}
