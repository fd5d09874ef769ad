//! # authevents (Event Rules for Multi-Factor Authentication)
//!
//! `authevents` attaches administrator-defined rules to the request pipeline of an
//! authentication server. Each rule names the events it listens to, a position
//! (`pre` runs before the core action, `post` after it), a set of conditions and an
//! action carried out by one of the built-in handlers.
//!
//! ## Pipeline
//!
//! For every wrapped request the engine loads the active rules for the event, resolves the
//! user and token the request is about once, evaluates the conditions in rule order and
//! runs the matching actions. Handlers may rewrite request parameters (`pre`) or the JSON
//! response (`post`), touch tokens and user attributes, call webhooks, forward the request
//! to a remote server or run local scripts.
//!
//! A failing action is logged and recorded in the audit trail without affecting the other
//! rules, unless it is marked as request-aborting (for example a script with `raise_error`).
//!
//! ## Storage
//!
//! Rules, counters, tokens and users live in `PostgreSQL` (see `db/sql/01_authevents.sql`).
//! Every store is a trait with an in-memory implementation for tests and embedders.

pub mod api;
pub mod cli;
pub mod events;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
