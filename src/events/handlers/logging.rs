use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::template::Tags;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

pub const NAME: &str = "logging";

const DEFAULT_MESSAGE: &str = "event={action} triggered by user={logged_in_user} for serial={serial}";
const LEVELS: &[&str] = &["trace", "debug", "info", "warning", "error"];

/// Emits a templated message through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl ActionHandler for LoggingHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Write a templated message to a named log sink"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        BTreeMap::from([(
            "logging".to_string(),
            vec![
                OptionSpec::new("name", OptionKind::Text, "Name of the logger")
                    .with_default("authevents.audit"),
                OptionSpec::new("level", OptionKind::Choice(LEVELS), "Log level")
                    .with_default("info"),
                OptionSpec::new("message", OptionKind::Text, "Message template with {tags}")
                    .with_default(DEFAULT_MESSAGE),
            ],
        )])
    }

    async fn execute(
        &self,
        _action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let tags = Tags::collect(ctx.event, ctx.subject, Utc::now());
        let message = tags.render(options.text("message").unwrap_or(DEFAULT_MESSAGE));
        let logger = options.text("name").unwrap_or_default();

        match options.text("level").unwrap_or("info") {
            "trace" => trace!(logger, rule = ctx.rule, "{message}"),
            "debug" => debug!(logger, rule = ctx.rule, "{message}"),
            "warning" => warn!(logger, rule = ctx.rule, "{message}"),
            "error" => error!(logger, rule = ctx.rule, "{message}"),
            _ => info!(logger, rule = ctx.rule, "{message}"),
        }
        Ok(true)
    }
}
