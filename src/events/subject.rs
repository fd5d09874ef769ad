//! Token and user state resolved once per dispatch.

use crate::events::context::EventContext;
use crate::events::registry::Services;
use crate::events::store::{StoreError, Token, User, UserRef};
use tracing::debug;

/// Read-only snapshot of the token and user a request is about.
#[derive(Debug, Clone, Default)]
pub struct Subject {
    /// User named by the request, or the owner of the explicit token.
    pub user: Option<User>,
    /// Identity of `user` even when the directory lookup failed.
    pub user_ref: Option<UserRef>,
    /// All tokens of the request user.
    pub user_tokens: Vec<Token>,
    /// The single resolved token: the explicit serial, else the user's only token.
    pub token: Option<Token>,
    /// Directory entry of the resolved token's owner, `None` when orphaned or unowned.
    pub token_owner: Option<User>,
}

impl Subject {
    /// Resolve from the request serial and user.
    ///
    /// # Errors
    /// Returns a `StoreError` if a lookup fails.
    pub async fn resolve(ctx: &EventContext, services: &Services) -> Result<Self, StoreError> {
        let mut subject = Self::default();

        let serial = ctx.serial();
        let explicit = match &serial {
            Some(serial) => services.tokens.token(serial).await?,
            None => None,
        };

        let user_ref = ctx
            .request_user()
            .or_else(|| explicit.as_ref().and_then(|token| token.owner.clone()));

        if let Some(user_ref) = &user_ref {
            subject.user = services.users.user(&user_ref.login, &user_ref.realm).await?;
            subject.user_tokens = services.tokens.tokens_for_user(user_ref).await?;
        }
        subject.user_ref = user_ref;

        subject.token = match explicit {
            Some(token) => Some(token),
            None if serial.is_none() && subject.user_tokens.len() == 1 => {
                subject.user_tokens.first().cloned()
            }
            None => None,
        };

        if let Some(owner) = subject.token.as_ref().and_then(|token| token.owner.as_ref()) {
            subject.token_owner = match &subject.user {
                Some(user) if user.login == owner.login && user.realm == owner.realm => {
                    Some(user.clone())
                }
                _ => services.users.user(&owner.login, &owner.realm).await?,
            };
        }

        debug!(
            token = subject.token.as_ref().map(|token| token.serial.as_str()),
            user_tokens = subject.user_tokens.len(),
            "resolved event subject"
        );

        Ok(subject)
    }
}
