//! Runs executables from the configured script directory.
//!
//! Every file in the directory becomes an action. Runs are bounded by a timeout and by a
//! shared semaphore; a child that outlives its timeout is killed, and detached runs are
//! reaped by a background task so no zombies are left behind.

use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub const NAME: &str = "script";

pub const MODE_WAIT: &str = "wait";
pub const MODE_BACKGROUND: &str = "background";

/// Context values that may be passed to the script as `--<flag> <value>`.
const ARGUMENT_FLAGS: &[&str] = &["serial", "user", "realm", "logged_in_user", "logged_in_role"];

const SCHEMA: &[OptionSpec] = &[
    OptionSpec::new(
        "background",
        OptionKind::Choice(&[MODE_WAIT, MODE_BACKGROUND]),
        "Wait for the script or run it detached",
    )
    .with_default(MODE_BACKGROUND),
    OptionSpec::new(
        "raise_error",
        OptionKind::Bool,
        "Fail the request when the script cannot start or exits non-zero",
    ),
    OptionSpec::new("serial", OptionKind::Bool, "Pass --serial"),
    OptionSpec::new("user", OptionKind::Bool, "Pass --user"),
    OptionSpec::new("realm", OptionKind::Bool, "Pass --realm"),
    OptionSpec::new("logged_in_user", OptionKind::Bool, "Pass --logged_in_user"),
    OptionSpec::new("logged_in_role", OptionKind::Bool, "Pass --logged_in_role"),
];

#[derive(Debug, Clone)]
pub struct ScriptHandler {
    directory: Option<PathBuf>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ScriptHandler {
    #[must_use]
    pub fn new(directory: Option<PathBuf>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            directory,
            timeout,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Resolve an action name to a file inside the script directory.
    fn resolve(&self, script: &str) -> Result<PathBuf, HandlerError> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| HandlerError::Config("no script directory configured".to_string()))?;
        if script.is_empty()
            || script.contains('/')
            || script.contains('\\')
            || script.starts_with('.')
        {
            return Err(HandlerError::Config(format!("invalid script name: {script}")));
        }
        let path = directory.join(script);
        if !is_executable(&path) {
            return Err(HandlerError::Config(format!(
                "script {} is not an executable file",
                path.display()
            )));
        }
        Ok(path)
    }

    fn arguments(options: &ActionOptions, ctx: &ActionContext<'_>) -> Vec<String> {
        let mut args = Vec::new();
        for flag in ARGUMENT_FLAGS {
            if !options.bool(flag) {
                continue;
            }
            let value = match *flag {
                "serial" => ctx
                    .subject
                    .token
                    .as_ref()
                    .map(|token| token.serial.clone())
                    .or_else(|| ctx.event.serial()),
                "user" => ctx.subject.user_ref.as_ref().map(|user| user.login.clone()),
                "realm" => ctx.subject.user_ref.as_ref().map(|user| user.realm.clone()),
                "logged_in_user" => ctx.event.actor.as_ref().map(|actor| actor.username.clone()),
                "logged_in_role" => ctx
                    .event
                    .actor
                    .as_ref()
                    .map(|actor| actor.role.as_str().to_string()),
                _ => None,
            };
            args.push(format!("--{flag}"));
            args.push(value.unwrap_or_default());
        }
        args
    }

    fn spawn(path: &Path, args: &[String]) -> std::io::Result<Child> {
        Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    async fn run_to_completion(
        &self,
        path: &Path,
        args: &[String],
    ) -> Result<ExitStatus, HandlerError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HandlerError::Config("script pool closed".to_string()))?;
        let mut child = Self::spawn(path, args)?;
        wait_bounded(&mut child, self.timeout).await
    }

    fn run_detached(&self, rule: &str, path: PathBuf, args: Vec<String>) {
        let permits = self.permits.clone();
        let timeout = self.timeout;
        let rule = rule.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(rule, "script pool closed, dropping detached run");
                return;
            };
            let result = match Self::spawn(&path, &args) {
                Ok(mut child) => wait_bounded(&mut child, timeout).await,
                Err(err) => Err(HandlerError::Io(err)),
            };
            match result {
                Ok(status) if status.success() => {
                    debug!(rule, script = %path.display(), "detached script finished");
                }
                Ok(status) => {
                    warn!(rule, script = %path.display(), %status, "detached script failed");
                }
                Err(err) => {
                    error!(rule, script = %path.display(), "detached script error: {err}");
                }
            }
        });
    }
}

/// Wait for a child, killing it once the timeout elapses.
async fn wait_bounded(child: &mut Child, timeout: Duration) -> Result<ExitStatus, HandlerError> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            child.kill().await?;
            Err(HandlerError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("script did not finish within {}s", timeout.as_secs()),
            )))
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl ActionHandler for ScriptHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Run an executable from the script directory"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        let Some(directory) = &self.directory else {
            return BTreeMap::new();
        };
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Failed to read script directory {}: {err}", directory.display());
                return BTreeMap::new();
            }
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| is_executable(&entry.path()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .map(|name| (name, SCHEMA.to_vec()))
            .collect()
    }

    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let raise_error = options.bool("raise_error");
        let path = match self.resolve(action) {
            Ok(path) => path,
            Err(err) if raise_error => return Err(HandlerError::Hard(err.to_string())),
            Err(err) => {
                warn!(rule = ctx.rule, "Script {action} not runnable: {err}");
                return Ok(false);
            }
        };
        let args = Self::arguments(options, ctx);

        if options.text("background") == Some(MODE_BACKGROUND) {
            info!(rule = ctx.rule, script = %path.display(), "starting detached script");
            self.run_detached(ctx.rule, path, args);
            return Ok(true);
        }

        info!(rule = ctx.rule, script = %path.display(), "running script");
        match self.run_to_completion(&path, &args).await {
            Ok(status) if status.success() => Ok(true),
            Ok(status) if raise_error => Err(HandlerError::Hard(format!(
                "script {action} failed with {status}"
            ))),
            Ok(status) => {
                warn!(rule = ctx.rule, %status, "Script {action} failed");
                Ok(false)
            }
            Err(err) if raise_error => Err(HandlerError::Hard(format!("script {action}: {err}"))),
            Err(err) => {
                warn!(rule = ctx.rule, "Script {action} error: {err}");
                Ok(false)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        let handler = ScriptHandler::new(Some(std::env::temp_dir()), Duration::from_secs(1), 1);
        assert!(matches!(handler.resolve("../bin/sh"), Err(HandlerError::Config(_))));
        assert!(matches!(handler.resolve(".hidden"), Err(HandlerError::Config(_))));
        assert!(matches!(handler.resolve(""), Err(HandlerError::Config(_))));
    }

    #[test]
    fn no_directory_means_no_actions() {
        let handler = ScriptHandler::new(None, Duration::from_secs(1), 1);
        assert!(handler.actions().is_empty());
        assert!(matches!(handler.resolve("notify"), Err(HandlerError::Config(_))));
    }
}
