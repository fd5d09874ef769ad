//! `{tag}` placeholder substitution for messages, payloads and descriptions.

use crate::events::compare::format_timestamp;
use crate::events::context::EventContext;
use crate::events::subject::Subject;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static TAG_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\{([A-Za-z_]+)\}").ok());

/// Values available to templates for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    values: BTreeMap<&'static str, String>,
}

impl Tags {
    /// Collect tags from the request, the logged-in actor and the resolved subject.
    #[must_use]
    pub fn collect(ctx: &EventContext, subject: &Subject, now: DateTime<Utc>) -> Self {
        let mut tags = Self::default();

        tags.set("action", &ctx.event);
        tags.set("time", &now.format("%H:%M:%S").to_string());
        tags.set("date", &now.format("%Y-%m-%d").to_string());
        tags.set("timestamp", &format_timestamp(now));

        if let Some(ip) = ctx.client_ip {
            tags.set("client_ip", &ip.to_string());
        }

        if let Some(actor) = &ctx.actor {
            tags.set("logged_in_user", &actor.username);
            tags.set("logged_in_role", actor.role.as_str());
            tags.set("realm", &actor.realm);
        }

        if let Some(user_ref) = &subject.user_ref {
            tags.set("user", &user_ref.login);
            tags.set("username", &user_ref.login);
            tags.set("userrealm", &user_ref.realm);
        }
        if let Some(user) = &subject.user {
            tags.set("surname", &user.surname);
            tags.set("givenname", &user.givenname);
            tags.set("email", &user.email);
        }

        if let Some(serial) = ctx.serial() {
            tags.set("serial", &serial);
        }
        if let Some(token) = &subject.token {
            tags.set("serial", &token.serial);
            tags.set("token_serial", &token.serial);
            tags.set("tokentype", &token.tokentype);
            if let Some(owner) = &token.owner {
                tags.set("token_owner", &owner.login);
                tags.set("user_realm", &owner.realm);
            }
        }

        tags
    }

    pub fn set(&mut self, key: &'static str, value: &str) {
        self.values.insert(key, value.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Replace every known `{tag}`; unknown placeholders, `{now}` included, stay as written.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        let Some(pattern) = TAG_PATTERN.as_ref() else {
            return template.to_string();
        };
        pattern
            .replace_all(template, |captures: &Captures<'_>| {
                self.get(&captures[1])
                    .map_or_else(|| captures[0].to_string(), ToString::to_string)
            })
            .into_owned()
    }
}
