use crate::{api, events::handlers::HandlerConfig};
use anyhow::Result;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub handlers: HandlerConfig,
    pub max_body_bytes: usize,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);
    api::new(args.port, &args.dsn, &args.handlers, args.max_body_bytes).await
}

fn log_startup_args(args: &Args) {
    let remotes = args
        .handlers
        .remote_servers
        .iter()
        .map(|(name, url)| format!("{name}={url}"))
        .collect::<Vec<_>>()
        .join(",");
    info!(
        port = args.port,
        dsn = %redact_dsn(&args.dsn),
        script_dir = ?args.handlers.script_dir,
        script_timeout = ?args.handlers.script_timeout,
        script_concurrency = args.handlers.script_concurrency,
        http_timeout = ?args.handlers.http_timeout,
        remotes,
        max_body_bytes = args.max_body_bytes,
        "{} {} - {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
