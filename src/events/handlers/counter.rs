use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

pub const NAME: &str = "counter";
pub const ACTION_INCREASE: &str = "increase_counter";
pub const ACTION_DECREASE: &str = "decrease_counter";
pub const ACTION_RESET: &str = "reset_counter";

/// Maintains named counters that the `counter` condition reads.
#[derive(Debug, Default)]
pub struct CounterHandler;

#[async_trait]
impl ActionHandler for CounterHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Increase, decrease or reset a named counter"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        let name =
            OptionSpec::new("counter_name", OptionKind::Text, "Name of the counter").required();
        BTreeMap::from([
            (ACTION_INCREASE.to_string(), vec![name.clone()]),
            (
                ACTION_DECREASE.to_string(),
                vec![
                    name.clone(),
                    OptionSpec::new(
                        "allow_negative_values",
                        OptionKind::Bool,
                        "Let the counter drop below zero",
                    ),
                ],
            ),
            (ACTION_RESET.to_string(), vec![name]),
        ])
    }

    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let Some(counter) = options.text("counter_name") else {
            return Ok(false);
        };
        let counters = &ctx.services.counters;
        let value = match action {
            ACTION_INCREASE => counters.increase(counter).await?,
            ACTION_DECREASE => {
                counters
                    .decrease(counter, options.bool("allow_negative_values"))
                    .await?
            }
            ACTION_RESET => {
                counters.reset(counter).await?;
                0
            }
            _ => return Ok(false),
        };
        debug!(rule = ctx.rule, counter, value, "counter updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::context::{EventContext, RequestSnapshot};
    use crate::events::registry::Services;
    use crate::events::store::{CounterStore, MemoryCounterStore, MemoryDirectory};
    use crate::events::subject::Subject;
    use std::sync::Arc;

    #[tokio::test]
    async fn actions_update_the_store() -> Result<(), HandlerError> {
        let directory = Arc::new(MemoryDirectory::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let services = Services {
            tokens: directory.clone(),
            users: directory,
            counters: counters.clone(),
        };
        let mut event = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"));
        let subject = Subject::default();
        let mut ctx = ActionContext {
            rule: "count",
            event: &mut event,
            subject: &subject,
            services: &services,
        };
        let handler = CounterHandler;
        let schema = handler.actions();
        let raw = BTreeMap::from([("counter_name".to_string(), "fails".to_string())]);

        for action in [ACTION_INCREASE, ACTION_INCREASE, ACTION_DECREASE] {
            let options =
                ActionOptions::from_raw(action, &schema[action], &raw).unwrap_or_default();
            assert!(handler.execute(action, &options, &mut ctx).await?);
        }
        assert_eq!(counters.read("fails").await?, 1);

        let options = ActionOptions::from_raw(ACTION_RESET, &schema[ACTION_RESET], &raw)
            .unwrap_or_default();
        assert!(handler.execute(ACTION_RESET, &options, &mut ctx).await?);
        assert_eq!(counters.read("fails").await?, 0);
        Ok(())
    }
}
