//! Action handler interface and the registry that validates rules against it.

use crate::events::conditions::{self, ConditionSpec};
use crate::events::context::EventContext;
use crate::events::rule::{EventRule, Position, RuleError};
use crate::events::store::{CounterStore, StoreError, TokenStore, UserStore};
use crate::events::subject::Subject;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Type of a handler option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "values")]
pub enum OptionKind {
    Bool,
    Int,
    Text,
    Choice(&'static [&'static str]),
}

/// Schema entry for one option of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

impl OptionSpec {
    #[must_use]
    pub const fn new(name: &'static str, kind: OptionKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            description,
        }
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub const fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    fn parse(&self, raw: &str) -> Result<OptionValue, RuleError> {
        let invalid = |reason: String| RuleError::InvalidOption {
            option: self.name.to_string(),
            reason,
        };
        match self.kind {
            OptionKind::Bool => Ok(OptionValue::Bool(crate::events::compare::is_true(raw))),
            OptionKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|err| invalid(err.to_string())),
            OptionKind::Text => Ok(OptionValue::Text(raw.to_string())),
            OptionKind::Choice(values) => values
                .iter()
                .find(|value| value.eq_ignore_ascii_case(raw.trim()))
                .map(|value| OptionValue::Text((*value).to_string()))
                .ok_or_else(|| invalid(format!("expected one of {}", values.join(", ")))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Options of one rule after validation against its action's schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOptions {
    values: BTreeMap<String, OptionValue>,
}

impl ActionOptions {
    #[must_use]
    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(OptionValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Text or choice value; empty strings read as unset.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::Text(value)) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    /// Validate raw string options against a schema.
    ///
    /// # Errors
    /// Returns a `RuleError` for unknown options, missing required options or values that do
    /// not parse as the declared kind.
    pub fn from_raw(
        action: &str,
        schema: &[OptionSpec],
        raw: &BTreeMap<String, String>,
    ) -> Result<Self, RuleError> {
        if let Some(unknown) = raw
            .keys()
            .find(|key| !schema.iter().any(|spec| spec.name == key.as_str()))
        {
            return Err(RuleError::UnknownOption {
                action: action.to_string(),
                option: unknown.clone(),
            });
        }

        let mut values = BTreeMap::new();
        for spec in schema {
            let raw_value = raw
                .get(spec.name)
                .map(String::as_str)
                .filter(|value| !value.is_empty())
                .or(spec.default);
            match raw_value {
                Some(raw_value) => {
                    values.insert(spec.name.to_string(), spec.parse(raw_value)?);
                }
                None if spec.required => {
                    return Err(RuleError::MissingOption {
                        action: action.to_string(),
                        option: spec.name.to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(Self { values })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Aborts the whole request; only raised when a rule explicitly asks for it.
    #[error("{0}")]
    Hard(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Persistence capabilities shared by every handler.
#[derive(Clone)]
pub struct Services {
    pub tokens: Arc<dyn TokenStore>,
    pub users: Arc<dyn UserStore>,
    pub counters: Arc<dyn CounterStore>,
}

/// What a handler gets for one execution.
pub struct ActionContext<'a> {
    pub rule: &'a str,
    pub event: &'a mut EventContext,
    pub subject: &'a Subject,
    pub services: &'a Services,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Identifier stored in `EventRule::handler`.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn allowed_positions(&self) -> &'static [Position] {
        &[Position::Pre, Position::Post]
    }

    /// Action name to option schema.
    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>>;

    /// Condition metadata for UIs and save-time validation.
    fn conditions(&self) -> Vec<ConditionSpec> {
        conditions::condition_specs()
    }

    /// Run an action. `Ok(false)` reports a handled failure.
    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub positions: Vec<Position>,
}

/// Handler type name to implementation, filled once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(name)
    }

    #[must_use]
    pub fn list(&self) -> Vec<HandlerInfo> {
        self.handlers
            .values()
            .map(|handler| HandlerInfo {
                name: handler.name(),
                description: handler.description(),
                positions: handler.allowed_positions().to_vec(),
            })
            .collect()
    }

    /// Check a rule against its handler's positions, actions, options and conditions.
    ///
    /// # Errors
    /// Returns the first `RuleError` found.
    pub fn validate(&self, rule: &EventRule) -> Result<ActionOptions, RuleError> {
        rule.check_shape()?;

        let handler = self
            .get(&rule.handler)
            .ok_or_else(|| RuleError::UnknownHandler(rule.handler.clone()))?;

        if !handler.allowed_positions().contains(&rule.position) {
            return Err(RuleError::PositionNotAllowed {
                handler: rule.handler.clone(),
                position: rule.position,
            });
        }

        let actions = handler.actions();
        let schema = actions
            .get(&rule.action)
            .ok_or_else(|| RuleError::UnknownAction {
                handler: rule.handler.clone(),
                action: rule.action.clone(),
            })?;

        let known = handler.conditions();
        if let Some(unknown) = rule
            .conditions
            .keys()
            .find(|key| !known.iter().any(|spec| spec.key == key.as_str()))
        {
            return Err(RuleError::UnknownCondition(unknown.clone()));
        }

        ActionOptions::from_raw(&rule.action, schema, &rule.options)
    }
}
