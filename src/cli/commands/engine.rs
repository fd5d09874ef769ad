//! Arguments for the action handlers: scripts, outbound HTTP and federation targets.

use crate::events::handlers::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_SCRIPT_CONCURRENCY, DEFAULT_SCRIPT_TIMEOUT, HandlerConfig,
};
use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const ARG_SCRIPT_DIR: &str = "script-dir";
pub const ARG_SCRIPT_TIMEOUT: &str = "script-timeout-seconds";
pub const ARG_SCRIPT_CONCURRENCY: &str = "script-concurrency";
pub const ARG_WEBHOOK_TIMEOUT: &str = "webhook-timeout-seconds";
pub const ARG_REMOTE_SERVER: &str = "remote-server";
pub const ARG_MAX_BODY_BYTES: &str = "max-body-bytes";

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SCRIPT_DIR)
                .long(ARG_SCRIPT_DIR)
                .help("Directory holding the scripts rules may run")
                .env("AUTHEVENTS_SCRIPT_DIR")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(ARG_SCRIPT_TIMEOUT)
                .long(ARG_SCRIPT_TIMEOUT)
                .help("Seconds a script may run before it is killed")
                .env("AUTHEVENTS_SCRIPT_TIMEOUT_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SCRIPT_CONCURRENCY)
                .long(ARG_SCRIPT_CONCURRENCY)
                .help("Maximum number of scripts running at the same time")
                .env("AUTHEVENTS_SCRIPT_CONCURRENCY")
                .default_value("8")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_WEBHOOK_TIMEOUT)
                .long(ARG_WEBHOOK_TIMEOUT)
                .help("Timeout in seconds for webhook and federation requests")
                .env("AUTHEVENTS_WEBHOOK_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REMOTE_SERVER)
                .long(ARG_REMOTE_SERVER)
                .help("Federation target as name=url, may be repeated")
                .env("AUTHEVENTS_REMOTE_SERVERS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_MAX_BODY_BYTES)
                .long(ARG_MAX_BODY_BYTES)
                .help("Largest request or response body the event hook buffers")
                .env("AUTHEVENTS_MAX_BODY_BYTES")
                .default_value("1048576")
                .value_parser(clap::value_parser!(usize)),
        )
}

/// Parse one `name=url` federation target.
fn remote_server(value: &str) -> Result<(String, Url)> {
    let (name, url) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("remote server {value} is not name=url"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("remote server {value} has an empty name"));
    }
    let url = Url::parse(url.trim()).with_context(|| format!("invalid URL for remote {name}"))?;
    Ok((name.to_string(), url))
}

/// Build the handler configuration from parsed arguments.
///
/// # Errors
/// Returns an error if a `--remote-server` value is malformed.
pub fn handler_config(matches: &ArgMatches) -> Result<HandlerConfig> {
    let remote_servers = matches
        .get_many::<String>(ARG_REMOTE_SERVER)
        .into_iter()
        .flatten()
        .map(|value| remote_server(value))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(HandlerConfig {
        script_dir: matches.get_one::<PathBuf>(ARG_SCRIPT_DIR).cloned(),
        script_timeout: matches
            .get_one::<u64>(ARG_SCRIPT_TIMEOUT)
            .map_or(DEFAULT_SCRIPT_TIMEOUT, |secs| Duration::from_secs(*secs)),
        script_concurrency: matches
            .get_one::<u32>(ARG_SCRIPT_CONCURRENCY)
            .and_then(|n| usize::try_from(*n).ok())
            .unwrap_or(DEFAULT_SCRIPT_CONCURRENCY),
        http_timeout: matches
            .get_one::<u64>(ARG_WEBHOOK_TIMEOUT)
            .map_or(DEFAULT_HTTP_TIMEOUT, |secs| Duration::from_secs(*secs)),
        remote_servers,
    })
}
