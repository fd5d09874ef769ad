//! Persisted event rule configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Event names that match every event.
pub const WILDCARD_EVENTS: [&str; 2] = ["*", "any"];

/// Where in the request pipeline a rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Pre,
    Post,
}

impl Position {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Position {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pre" => Ok(Self::Pre),
            "post" => Ok(Self::Post),
            other => Err(RuleError::InvalidPosition(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("rule must name at least one event")]
    NoEvents,
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("unknown handler: {0}")]
    UnknownHandler(String),
    #[error("handler {handler} has no action {action}")]
    UnknownAction { handler: String, action: String },
    #[error("handler {handler} does not run at position {position}")]
    PositionNotAllowed { handler: String, position: Position },
    #[error("unknown condition: {0}")]
    UnknownCondition(String),
    #[error("unknown option {option} for action {action}")]
    UnknownOption { action: String, option: String },
    #[error("missing required option {option} for action {action}")]
    MissingOption { action: String, option: String },
    #[error("invalid value for option {option}: {reason}")]
    InvalidOption { option: String, reason: String },
}

/// A persisted binding of events, position, conditions and one handler action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EventRule {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub events: Vec<String>,
    pub handler: String,
    pub action: String,
    pub position: Position,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub ordering: i32,
}

const fn default_active() -> bool {
    true
}

impl EventRule {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        events: &[&str],
        handler: impl Into<String>,
        action: impl Into<String>,
        position: Position,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            events: events.iter().map(ToString::to_string).collect(),
            handler: handler.into(),
            action: action.into(),
            position,
            conditions: BTreeMap::new(),
            options: BTreeMap::new(),
            active: true,
            ordering: 0,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, key: &str, value: &str) -> Self {
        self.conditions.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_ordering(mut self, ordering: i32) -> Self {
        self.ordering = ordering;
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn handles(&self, event: &str) -> bool {
        self.events
            .iter()
            .any(|name| name == event || WILDCARD_EVENTS.contains(&name.as_str()))
    }

    /// Structural checks that do not need the handler registry.
    ///
    /// # Errors
    /// Returns a `RuleError` when the name or event list is empty.
    pub fn check_shape(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.events.iter().all(|event| event.trim().is_empty()) {
            return Err(RuleError::NoEvents);
        }
        Ok(())
    }
}
