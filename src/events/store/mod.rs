//! Narrow persistence capabilities handed to the engine and its handlers.
//!
//! Handlers never see a pool or a connection: they get read accessors and the atomic
//! mutations listed here. Each trait has a Postgres implementation and an in-memory one.

pub mod memory;
pub mod postgres;

use crate::events::rule::EventRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use memory::{MemoryCounterStore, MemoryDirectory, MemoryRuleStore};
pub use postgres::{PgCounterStore, PgDirectory, PgRuleStore};

pub const TOKENINFO_COUNT_AUTH: &str = "count_auth";
pub const TOKENINFO_COUNT_AUTH_SUCCESS: &str = "count_auth_success";
pub const TOKENINFO_LAST_AUTH: &str = "last_auth";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Identifies a user by login within a realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserRef {
    pub login: String,
    pub realm: String,
    #[serde(default)]
    pub resolver: String,
}

impl UserRef {
    #[must_use]
    pub fn new(login: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            realm: realm.into(),
            resolver: String::new(),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: impl Into<String>) -> Self {
        self.resolver = resolver.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub realm: String,
    pub resolver: String,
    pub surname: String,
    pub givenname: String,
    pub email: String,
    pub attributes: BTreeMap<String, String>,
}

impl User {
    #[must_use]
    pub fn user_ref(&self) -> UserRef {
        UserRef::new(&self.login, &self.realm).with_resolver(&self.resolver)
    }

    /// Attribute lookup used by the `userinfo` condition; custom attributes win over
    /// directory fields of the same name.
    #[must_use]
    pub fn info(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.attributes.get(key) {
            return Some(value);
        }
        match key {
            "username" | "login" => Some(&self.login),
            "surname" => Some(&self.surname),
            "givenname" => Some(&self.givenname),
            "email" => Some(&self.email),
            "realm" => Some(&self.realm),
            "resolver" => Some(&self.resolver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub serial: String,
    pub tokentype: String,
    pub description: String,
    pub active: bool,
    pub owner: Option<UserRef>,
    pub realms: Vec<String>,
    pub fail_count: i64,
    pub max_fail: i64,
    pub otp_counter: i64,
    pub count_window: i64,
    pub validity_start: Option<DateTime<Utc>>,
    pub validity_end: Option<DateTime<Utc>>,
    pub rollout_state: String,
    pub info: BTreeMap<String, String>,
    pub groups: BTreeSet<String>,
}

impl Token {
    #[must_use]
    pub fn new(serial: impl Into<String>, tokentype: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            tokentype: tokentype.into(),
            description: String::new(),
            active: true,
            owner: None,
            realms: Vec::new(),
            fail_count: 0,
            max_fail: 10,
            otp_counter: 0,
            count_window: 10,
            validity_start: None,
            validity_end: None,
            rollout_state: String::new(),
            info: BTreeMap::new(),
            groups: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.fail_count >= self.max_fail
    }

    #[must_use]
    pub fn in_validity_period(&self, now: DateTime<Utc>) -> bool {
        self.validity_start.is_none_or(|start| now >= start)
            && self.validity_end.is_none_or(|end| now <= end)
    }

    fn info_counter(&self, key: &str) -> i64 {
        self.info
            .get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn count_auth(&self) -> i64 {
        self.info_counter(TOKENINFO_COUNT_AUTH)
    }

    #[must_use]
    pub fn count_auth_success(&self) -> i64 {
        self.info_counter(TOKENINFO_COUNT_AUTH_SUCCESS)
    }

    #[must_use]
    pub fn count_auth_fail(&self) -> i64 {
        self.count_auth() - self.count_auth_success()
    }

    #[must_use]
    pub fn last_auth(&self) -> Option<DateTime<Utc>> {
        self.info
            .get(TOKENINFO_LAST_AUTH)
            .and_then(|value| crate::events::compare::parse_timestamp(value))
    }

    /// Apply a mutation in place; shared by the in-memory store and tests.
    pub fn apply(&mut self, mutation: &TokenMutation) {
        match mutation {
            TokenMutation::SetRealms(realms) => self.realms.clone_from(realms),
            TokenMutation::AddRealm(realm) => {
                if !self.realms.contains(realm) {
                    self.realms.push(realm.clone());
                }
            }
            TokenMutation::SetActive(active) => self.active = *active,
            TokenMutation::Unassign => {
                self.owner = None;
                self.fail_count = 0;
            }
            TokenMutation::SetDescription(description) => self.description.clone_from(description),
            TokenMutation::SetValidity { start, end } => {
                self.validity_start = *start;
                self.validity_end = *end;
            }
            TokenMutation::SetCountWindow(window) => self.count_window = *window,
            TokenMutation::SetFailCount(count) => self.fail_count = *count,
            TokenMutation::ChangeFailCount(delta) => {
                self.fail_count = self.fail_count.saturating_add(*delta).max(0);
            }
            TokenMutation::SetInfo { key, value } => {
                self.info.insert(key.clone(), value.clone());
            }
            TokenMutation::DeleteInfo(key) => {
                self.info.remove(key);
            }
            TokenMutation::AddGroup(group) => {
                self.groups.insert(group.clone());
            }
            TokenMutation::RemoveGroup(group) => {
                self.groups.remove(group);
            }
        }
    }
}

/// Atomic token updates available to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMutation {
    SetRealms(Vec<String>),
    AddRealm(String),
    SetActive(bool),
    Unassign,
    SetDescription(String),
    SetValidity {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    SetCountWindow(i64),
    SetFailCount(i64),
    ChangeFailCount(i64),
    SetInfo { key: String, value: String },
    DeleteInfo(String),
    AddGroup(String),
    RemoveGroup(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn token(&self, serial: &str) -> Result<Option<Token>, StoreError>;
    async fn tokens_for_user(&self, user: &UserRef) -> Result<Vec<Token>, StoreError>;
    async fn create_token(&self, token: Token) -> Result<(), StoreError>;
    async fn delete_token(&self, serial: &str) -> Result<(), StoreError>;
    async fn update_token(&self, serial: &str, mutation: TokenMutation) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user(&self, login: &str, realm: &str) -> Result<Option<User>, StoreError>;
    async fn set_attribute(&self, user: &UserRef, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete_attribute(&self, user: &UserRef, key: &str) -> Result<(), StoreError>;
}

/// Named integer counters; every operation is a single atomic update.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increase(&self, name: &str) -> Result<i64, StoreError>;
    async fn decrease(&self, name: &str, allow_negative: bool) -> Result<i64, StoreError>;
    async fn reset(&self, name: &str) -> Result<(), StoreError>;
    /// Missing counters read as zero.
    async fn read(&self, name: &str) -> Result<i64, StoreError>;
}

/// Persisted event rules plus the configuration version used for cache invalidation.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list(&self) -> Result<Vec<EventRule>, StoreError>;
    async fn get(&self, id: i64) -> Result<Option<EventRule>, StoreError>;
    /// Insert (id `None`) or update the rule, returning its id.
    async fn save(&self, rule: &EventRule) -> Result<i64, StoreError>;
    async fn delete(&self, id: i64) -> Result<(), StoreError>;
    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError>;
    /// Monotonically increasing; bumped by every write.
    async fn config_version(&self) -> Result<i64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn token_lock_and_counts() {
        let mut token = Token::new("HOTP0001", "hotp");
        assert!(!token.is_locked());
        token.fail_count = 10;
        assert!(token.is_locked());

        token.info.insert(TOKENINFO_COUNT_AUTH.to_string(), "12".to_string());
        token.info.insert(TOKENINFO_COUNT_AUTH_SUCCESS.to_string(), "9".to_string());
        assert_eq!(token.count_auth(), 12);
        assert_eq!(token.count_auth_success(), 9);
        assert_eq!(token.count_auth_fail(), 3);
    }

    #[test]
    fn validity_period_bounds() {
        let now = Utc::now();
        let mut token = Token::new("TOTP0001", "totp");
        assert!(token.in_validity_period(now));
        token.validity_start = Some(now + Duration::days(1));
        assert!(!token.in_validity_period(now));
        token.validity_start = Some(now - Duration::days(1));
        token.validity_end = Some(now - Duration::hours(1));
        assert!(!token.in_validity_period(now));
    }

    #[test]
    fn fail_counter_change_clamps_at_zero() {
        let mut token = Token::new("HOTP0002", "hotp");
        token.fail_count = 2;
        token.apply(&TokenMutation::ChangeFailCount(-5));
        assert_eq!(token.fail_count, 0);
        token.apply(&TokenMutation::ChangeFailCount(3));
        assert_eq!(token.fail_count, 3);
    }

    #[test]
    fn user_info_prefers_custom_attributes() {
        let mut user = User {
            login: "alice".to_string(),
            surname: "Liddell".to_string(),
            ..User::default()
        };
        assert_eq!(user.info("surname"), Some("Liddell"));
        user.attributes.insert("surname".to_string(), "Custom".to_string());
        assert_eq!(user.info("surname"), Some("Custom"));
        assert_eq!(user.info("unknown"), None);
    }
}
