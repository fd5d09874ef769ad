//! Rule dispatcher.
//!
//! Selects the active rules for an `(event, position)` pair in `(ordering, name)` order,
//! evaluates their conditions and runs the matching handler actions. A failing rule is
//! logged and recorded in the audit trail; only [`HandlerError::Hard`] stops the dispatch
//! and reaches the caller.

use crate::events::conditions;
use crate::events::context::{AuditEntry, EventContext};
use crate::events::registry::{
    ActionContext, ActionOptions, HandlerError, HandlerRegistry, Services,
};
use crate::events::rule::{EventRule, Position};
use crate::events::store::RuleStore;
use crate::events::subject::Subject;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, error, info_span, warn};

/// A hard handler failure that must abort the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rule {rule} aborted the request: {message}")]
pub struct DispatchError {
    pub rule: String,
    pub message: String,
}

/// A rule whose options were validated against its handler.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: EventRule,
    pub options: ActionOptions,
}

#[derive(Debug)]
struct RuleCache {
    version: i64,
    rules: Arc<Vec<CompiledRule>>,
}

pub struct EventEngine {
    registry: HandlerRegistry,
    rules: Arc<dyn RuleStore>,
    services: Services,
    cache: RwLock<Option<RuleCache>>,
}

impl EventEngine {
    #[must_use]
    pub fn new(registry: HandlerRegistry, rules: Arc<dyn RuleStore>, services: Services) -> Self {
        Self {
            registry,
            rules,
            services,
            cache: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn rule_store(&self) -> &Arc<dyn RuleStore> {
        &self.rules
    }

    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Compiled rules for the current configuration version, reloading when it changed.
    pub async fn compiled_rules(&self) -> Arc<Vec<CompiledRule>> {
        let version = match self.rules.config_version().await {
            Ok(version) => version,
            Err(err) => {
                error!("Failed to read event configuration version: {err}");
                return self
                    .cache
                    .read()
                    .await
                    .as_ref()
                    .map(|cache| cache.rules.clone())
                    .unwrap_or_default();
            }
        };

        if let Some(cache) = self.cache.read().await.as_ref()
            && cache.version == version
        {
            return cache.rules.clone();
        }

        let mut cache = self.cache.write().await;
        if let Some(current) = cache.as_ref()
            && current.version == version
        {
            return current.rules.clone();
        }

        let stored = match self.rules.list().await {
            Ok(stored) => stored,
            Err(err) => {
                error!("Failed to load event rules: {err}");
                return cache
                    .as_ref()
                    .map(|cache| cache.rules.clone())
                    .unwrap_or_default();
            }
        };

        let mut compiled: Vec<CompiledRule> = stored
            .into_iter()
            .filter_map(|rule| match self.registry.validate(&rule) {
                Ok(options) => Some(CompiledRule { rule, options }),
                Err(err) => {
                    warn!(rule = %rule.name, "Skipping invalid event rule: {err}");
                    None
                }
            })
            .collect();
        compiled.sort_by(|a, b| {
            a.rule
                .ordering
                .cmp(&b.rule.ordering)
                .then_with(|| a.rule.name.cmp(&b.rule.name))
        });

        debug!(version, rules = compiled.len(), "event rules reloaded");
        let rules = Arc::new(compiled);
        *cache = Some(RuleCache {
            version,
            rules: rules.clone(),
        });
        rules
    }

    /// Whether any active rule is bound to `event` at `position`.
    pub async fn has_rules(&self, event: &str, position: Position) -> bool {
        self.compiled_rules().await.iter().any(|compiled| {
            compiled.rule.active && compiled.rule.position == position && compiled.rule.handles(event)
        })
    }

    /// Run every matching rule for the context's event at `position`.
    ///
    /// # Errors
    /// Returns a `DispatchError` when a handler raised a hard failure; the remaining rules
    /// are not run.
    pub async fn dispatch(
        &self,
        ctx: &mut EventContext,
        position: Position,
    ) -> Result<(), DispatchError> {
        let rules = self.compiled_rules().await;
        let mut subject: Option<Subject> = None;

        let selected: Vec<&CompiledRule> = rules
            .iter()
            .filter(|compiled| {
                compiled.rule.active
                    && compiled.rule.position == position
                    && compiled.rule.handles(&ctx.event)
            })
            .collect();

        for compiled in selected {
            let rule = &compiled.rule;
            let Some(handler) = self.registry.get(&rule.handler) else {
                continue;
            };

            if subject.is_none() {
                subject = Some(match Subject::resolve(ctx, &self.services).await {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        warn!(event = %ctx.event, "Failed to resolve token and user: {err}");
                        Subject::default()
                    }
                });
            }
            let Some(resolved) = subject.as_ref() else {
                continue;
            };

            let counters = self.services.counters.as_ref();
            if !conditions::matches(&rule.conditions, ctx, resolved, counters).await {
                debug!(rule = %rule.name, event = %ctx.event, "conditions not met");
                continue;
            }

            let span = info_span!(
                "event.rule",
                rule = %rule.name,
                handler = %rule.handler,
                action = %rule.action,
                position = %position
            );
            let mut action_ctx = ActionContext {
                rule: &rule.name,
                event: &mut *ctx,
                subject: resolved,
                services: &self.services,
            };
            let outcome = handler
                .execute(&rule.action, &compiled.options, &mut action_ctx)
                .instrument(span)
                .await;

            let (success, info) = match &outcome {
                Ok(success) => (*success, String::new()),
                Err(err) => (false, err.to_string()),
            };
            ctx.audit.push(AuditEntry {
                event: ctx.event.clone(),
                position,
                rule: rule.name.clone(),
                handler: rule.handler.clone(),
                action: rule.action.clone(),
                success,
                info,
            });

            match outcome {
                Ok(true) => debug!(rule = %rule.name, "event action succeeded"),
                Ok(false) => warn!(rule = %rule.name, "Event action reported failure"),
                Err(HandlerError::Hard(message)) => {
                    error!(rule = %rule.name, "Event action aborted the request: {message}");
                    return Err(DispatchError {
                        rule: rule.name.clone(),
                        message,
                    });
                }
                Err(err) => error!(rule = %rule.name, "Event action failed: {err}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::context::RequestSnapshot;
    use crate::events::registry::{ActionHandler, OptionKind, OptionSpec};
    use crate::events::store::{MemoryCounterStore, MemoryDirectory, MemoryRuleStore, StoreError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records rule names; `fail` returns a soft error, `abort` a hard one.
    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ActionHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn description(&self) -> &'static str {
            "test"
        }

        fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
            let schema = vec![OptionSpec::new("tag", OptionKind::Text, "tag")];
            ["record", "fail", "abort"]
                .into_iter()
                .map(|action| (action.to_string(), schema.clone()))
                .collect()
        }

        async fn execute(
            &self,
            action: &str,
            _options: &ActionOptions,
            ctx: &mut ActionContext<'_>,
        ) -> Result<bool, HandlerError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(ctx.rule.to_string());
            }
            match action {
                "fail" => Err(HandlerError::Config("broken".to_string())),
                "abort" => Err(HandlerError::Hard("stop".to_string())),
                _ => Ok(true),
            }
        }
    }

    fn engine(rules: Arc<MemoryRuleStore>) -> (EventEngine, Arc<Mutex<Vec<String>>>) {
        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        let directory = Arc::new(MemoryDirectory::new());
        let services = Services {
            tokens: directory.clone(),
            users: directory,
            counters: Arc::new(MemoryCounterStore::new()),
        };
        let engine = EventEngine::new(HandlerRegistry::new().with(recorder), rules, services);
        (engine, calls)
    }

    fn recorded(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn context() -> EventContext {
        EventContext::new("validate_check", RequestSnapshot::new("POST", "/validate/check"))
    }

    #[tokio::test]
    async fn soft_failures_do_not_stop_later_rules() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRuleStore::new());
        store
            .save(&EventRule::new("a", &["*"], "recorder", "fail", Position::Post).with_ordering(1))
            .await?;
        store
            .save(&EventRule::new("b", &["*"], "recorder", "record", Position::Post).with_ordering(2))
            .await?;
        let (engine, calls) = engine(store);

        let mut ctx = context();
        assert_eq!(engine.dispatch(&mut ctx, Position::Post).await, Ok(()));
        assert_eq!(recorded(&calls), vec!["a", "b"]);
        assert_eq!(ctx.audit.len(), 2);
        assert!(!ctx.audit[0].success);
        assert!(ctx.audit[1].success);
        Ok(())
    }

    #[tokio::test]
    async fn hard_failure_aborts() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRuleStore::new());
        store
            .save(&EventRule::new("a", &["*"], "recorder", "abort", Position::Pre).with_ordering(1))
            .await?;
        store
            .save(&EventRule::new("b", &["*"], "recorder", "record", Position::Pre).with_ordering(2))
            .await?;
        let (engine, calls) = engine(store);

        let mut ctx = context();
        let result = engine.dispatch(&mut ctx, Position::Pre).await;
        assert_eq!(
            result,
            Err(DispatchError {
                rule: "a".to_string(),
                message: "stop".to_string()
            })
        );
        assert_eq!(recorded(&calls), vec!["a"]);
        Ok(())
    }

    #[tokio::test]
    async fn filters_by_event_position_and_active() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRuleStore::new());
        store
            .save(&EventRule::new("other", &["token_init"], "recorder", "record", Position::Post))
            .await?;
        store
            .save(&EventRule::new("pre", &["validate_check"], "recorder", "record", Position::Pre))
            .await?;
        store
            .save(
                &EventRule::new("off", &["validate_check"], "recorder", "record", Position::Post)
                    .with_active(false),
            )
            .await?;
        store
            .save(&EventRule::new("on", &["validate_check"], "recorder", "record", Position::Post))
            .await?;
        let (engine, calls) = engine(store);

        engine.dispatch(&mut context(), Position::Post).await.ok();
        assert_eq!(recorded(&calls), vec!["on"]);
        Ok(())
    }

    #[tokio::test]
    async fn cache_follows_configuration_version() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRuleStore::new());
        let id = store
            .save(&EventRule::new("a", &["*"], "recorder", "record", Position::Post))
            .await?;
        store
            .save(&EventRule::new("bad", &["*"], "nosuchhandler", "x", Position::Post))
            .await?;
        let (engine, _calls) = engine(store.clone());

        let first = engine.compiled_rules().await;
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &engine.compiled_rules().await));

        store.set_active(id, false).await?;
        let reloaded = engine.compiled_rules().await;
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert!(!reloaded[0].rule.active);
        Ok(())
    }

    #[tokio::test]
    async fn conditions_gate_execution() -> Result<(), StoreError> {
        let store = Arc::new(MemoryRuleStore::new());
        store
            .save(
                &EventRule::new("gated", &["*"], "recorder", "record", Position::Pre)
                    .with_condition("realm", "wonderland"),
            )
            .await?;
        let (engine, calls) = engine(store);

        engine.dispatch(&mut context(), Position::Pre).await.ok();
        assert!(recorded(&calls).is_empty());
        Ok(())
    }
}
