//! Event rule engine.
//!
//! Requests are wrapped by a `pre` and a `post` dispatch. At each point the engine picks
//! the active rules bound to the event, checks their conditions against the request, the
//! response, the resolved token and user, and runs the configured handler action.

pub mod compare;
pub mod conditions;
pub mod context;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod rule;
pub mod store;
pub mod subject;
pub mod template;

pub use context::{Actor, AuditEntry, EventContext, RequestSnapshot, ResponseSnapshot, Role};
pub use dispatch::{CompiledRule, DispatchError, EventEngine};
pub use registry::{ActionHandler, HandlerError, HandlerRegistry, Services};
pub use rule::{EventRule, Position, RuleError};
pub use subject::Subject;
