//! Built-in action handlers.

pub mod counter;
pub mod federation;
pub mod logging;
pub mod request_mangler;
pub mod response_mangler;
pub mod script;
pub mod token;
pub mod user_attributes;
pub mod webhook;

use crate::APP_USER_AGENT;
use crate::events::registry::HandlerRegistry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub use counter::CounterHandler;
pub use federation::FederationHandler;
pub use logging::LoggingHandler;
pub use request_mangler::RequestManglerHandler;
pub use response_mangler::ResponseManglerHandler;
pub use script::ScriptHandler;
pub use token::TokenHandler;
pub use user_attributes::UserAttributesHandler;
pub use webhook::WebhookHandler;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SCRIPT_CONCURRENCY: usize = 8;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings the built-in handlers need from the process configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub script_dir: Option<PathBuf>,
    pub script_timeout: Duration,
    pub script_concurrency: usize,
    pub http_timeout: Duration,
    /// Federation targets by name.
    pub remote_servers: BTreeMap<String, Url>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            script_dir: None,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            script_concurrency: DEFAULT_SCRIPT_CONCURRENCY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            remote_servers: BTreeMap::new(),
        }
    }
}

/// Registry with every built-in handler.
///
/// # Errors
/// Returns an error if the HTTP client cannot be built.
pub fn builtin(config: &HandlerConfig) -> Result<HandlerRegistry, reqwest::Error> {
    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(config.http_timeout)
        .build()?;

    Ok(HandlerRegistry::new()
        .with(LoggingHandler)
        .with(ScriptHandler::new(
            config.script_dir.clone(),
            config.script_timeout,
            config.script_concurrency,
        ))
        .with(WebhookHandler::new(client.clone()))
        .with(RequestManglerHandler)
        .with(ResponseManglerHandler)
        .with(FederationHandler::new(client, config.remote_servers.clone()))
        .with(TokenHandler)
        .with(UserAttributesHandler)
        .with(CounterHandler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_every_handler() -> Result<(), reqwest::Error> {
        let registry = builtin(&HandlerConfig::default())?;
        let names: Vec<&str> = registry.list().iter().map(|info| info.name).collect();
        assert_eq!(
            names,
            vec![
                "counter",
                "custom_user_attributes",
                "federation",
                "logging",
                "requestmangler",
                "responsemangler",
                "script",
                "token",
                "webhook",
            ]
        );
        Ok(())
    }
}
