use crate::events::registry::{
    ActionContext, ActionHandler, ActionOptions, HandlerError, OptionKind, OptionSpec,
};
use crate::events::store::{StoreError, UserRef};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const NAME: &str = "custom_user_attributes";
pub const ACTION_SET: &str = "set_custom_user_attributes";
pub const ACTION_DELETE: &str = "delete_custom_user_attribute";

pub const TARGET_TOKEN_OWNER: &str = "tokenowner";
pub const TARGET_LOGGED_IN_USER: &str = "logged_in_user";

/// Sets or deletes custom attributes on the token owner or the logged-in user.
#[derive(Debug, Default)]
pub struct UserAttributesHandler;

impl UserAttributesHandler {
    fn target(options: &ActionOptions, ctx: &ActionContext<'_>) -> Option<UserRef> {
        match options.text("user").unwrap_or(TARGET_TOKEN_OWNER) {
            TARGET_LOGGED_IN_USER => ctx.event.actor.as_ref().map(|actor| actor.user_ref()),
            _ => ctx.subject.token_owner.as_ref().map(|owner| owner.user_ref()),
        }
    }
}

#[async_trait]
impl ActionHandler for UserAttributesHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Set or delete custom user attributes"
    }

    fn actions(&self) -> BTreeMap<String, Vec<OptionSpec>> {
        const TARGETS: &[&str] = &[TARGET_TOKEN_OWNER, TARGET_LOGGED_IN_USER];
        let user = OptionSpec::new(
            "user",
            OptionKind::Choice(TARGETS),
            "Whose attribute to change",
        )
        .with_default(TARGET_TOKEN_OWNER);
        let key = OptionSpec::new("attrkey", OptionKind::Text, "Attribute key").required();
        BTreeMap::from([
            (
                ACTION_SET.to_string(),
                vec![
                    user.clone(),
                    key.clone(),
                    OptionSpec::new("attrvalue", OptionKind::Text, "Attribute value").required(),
                ],
            ),
            (ACTION_DELETE.to_string(), vec![user, key]),
        ])
    }

    async fn execute(
        &self,
        action: &str,
        options: &ActionOptions,
        ctx: &mut ActionContext<'_>,
    ) -> Result<bool, HandlerError> {
        let Some(user) = Self::target(options, ctx) else {
            debug!(rule = ctx.rule, "No user resolved, attribute left untouched");
            return Ok(false);
        };
        let key = options.text("attrkey").unwrap_or_default();

        let result = match action {
            ACTION_SET => {
                let value = options.text("attrvalue").unwrap_or_default();
                ctx.services.users.set_attribute(&user, key, value).await
            }
            ACTION_DELETE => ctx.services.users.delete_attribute(&user, key).await,
            _ => return Ok(false),
        };

        match result {
            Ok(()) => {
                info!(
                    rule = ctx.rule,
                    user = %user.login,
                    realm = %user.realm,
                    key,
                    action,
                    "user attribute changed"
                );
                Ok(true)
            }
            Err(StoreError::NotFound { .. }) => {
                debug!(rule = ctx.rule, user = %user.login, "User not found, attribute unchanged");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
