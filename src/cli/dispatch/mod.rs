use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_PORT, engine};
use anyhow::{Context, Result};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let handlers = engine::handler_config(matches).context("invalid handler configuration")?;
    let max_body_bytes = matches
        .get_one::<usize>(engine::ARG_MAX_BODY_BYTES)
        .copied()
        .unwrap_or(engine::DEFAULT_MAX_BODY_BYTES);

    Ok(Action::Server(Args {
        port,
        dsn,
        handlers,
        max_body_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn server_action_from_args() -> Result<()> {
        let matches = commands::new().try_get_matches_from([
            "authevents",
            "--dsn",
            "postgres://localhost/authevents",
            "--port",
            "9000",
            "--remote-server",
            "eu=https://eu.example",
        ])?;
        let Action::Server(args) = handler(&matches)?;
        assert_eq!(args.port, 9000);
        assert_eq!(args.dsn, "postgres://localhost/authevents");
        assert!(args.handlers.remote_servers.contains_key("eu"));
        Ok(())
    }

    #[test]
    fn malformed_remote_is_an_error() -> Result<()> {
        let matches = commands::new().try_get_matches_from([
            "authevents",
            "--dsn",
            "postgres://localhost/authevents",
            "--remote-server",
            "nonsense",
        ])?;
        assert!(handler(&matches).is_err());
        Ok(())
    }
}
