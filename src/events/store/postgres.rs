//! Postgres-backed stores. Schema lives in `db/sql/01_authevents.sql`.

use super::{
    CounterStore, RuleStore, StoreError, Token, TokenMutation, TokenStore, User, UserRef,
    UserStore,
};
use crate::events::rule::{EventRule, Position};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use tracing::{Instrument, info_span};

macro_rules! db_span {
    ($operation:expr, $query:expr) => {
        info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = $operation,
            db.statement = $query
        )
    };
}

#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increase(&self, name: &str) -> Result<i64, StoreError> {
        let query = "INSERT INTO event_counters (name, value) VALUES ($1, 1) \
                     ON CONFLICT (name) DO UPDATE SET value = event_counters.value + 1 \
                     RETURNING value";
        let value: i64 = sqlx::query_scalar(query)
            .bind(name)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await?;
        Ok(value)
    }

    async fn decrease(&self, name: &str, allow_negative: bool) -> Result<i64, StoreError> {
        let query = "INSERT INTO event_counters (name, value) \
                     VALUES ($1, CASE WHEN $2 THEN -1 ELSE 0 END) \
                     ON CONFLICT (name) DO UPDATE SET value = CASE \
                         WHEN $2 OR event_counters.value > 0 THEN event_counters.value - 1 \
                         ELSE event_counters.value END \
                     RETURNING value";
        let value: i64 = sqlx::query_scalar(query)
            .bind(name)
            .bind(allow_negative)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await?;
        Ok(value)
    }

    async fn reset(&self, name: &str) -> Result<(), StoreError> {
        let query = "INSERT INTO event_counters (name, value) VALUES ($1, 0) \
                     ON CONFLICT (name) DO UPDATE SET value = 0";
        sqlx::query(query)
            .bind(name)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<i64, StoreError> {
        let query = "SELECT value FROM event_counters WHERE name = $1";
        let value: Option<i64> = sqlx::query_scalar(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?;
        Ok(value.unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bump_version(tx: &mut Transaction<'_, Postgres>) -> Result<(), StoreError> {
        let query = "UPDATE event_config SET version = version + 1 WHERE id = 1";
        sqlx::query(query)
            .execute(&mut **tx)
            .instrument(db_span!("UPDATE", query))
            .await?;
        Ok(())
    }
}

const RULE_COLUMNS: &str =
    "id, name, events, handler, action, position, conditions, options, active, ordering";

fn rule_from_row(row: &PgRow) -> Result<EventRule, StoreError> {
    let position: String = row.try_get("position")?;
    let position = position
        .parse::<Position>()
        .map_err(|err| StoreError::Database(sqlx::Error::Decode(Box::new(err))))?;
    let Json(conditions): Json<BTreeMap<String, String>> = row.try_get("conditions")?;
    let Json(options): Json<BTreeMap<String, String>> = row.try_get("options")?;
    Ok(EventRule {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        events: row.try_get("events")?,
        handler: row.try_get("handler")?,
        action: row.try_get("action")?,
        position,
        conditions,
        options,
        active: row.try_get("active")?,
        ordering: row.try_get("ordering")?,
    })
}

fn map_unique_violation(err: sqlx::Error, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(format!("rule {name} already exists"))
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn list(&self) -> Result<Vec<EventRule>, StoreError> {
        let query = format!("SELECT {RULE_COLUMNS} FROM event_rules ORDER BY ordering, name");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<EventRule>, StoreError> {
        let query = format!("SELECT {RULE_COLUMNS} FROM event_rules WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn save(&self, rule: &EventRule) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id = match rule.id {
            None => {
                let query = "INSERT INTO event_rules \
                             (name, events, handler, action, position, conditions, options, active, ordering) \
                             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id";
                sqlx::query_scalar::<_, i64>(query)
                    .bind(&rule.name)
                    .bind(&rule.events)
                    .bind(&rule.handler)
                    .bind(&rule.action)
                    .bind(rule.position.as_str())
                    .bind(Json(&rule.conditions))
                    .bind(Json(&rule.options))
                    .bind(rule.active)
                    .bind(rule.ordering)
                    .fetch_one(&mut *tx)
                    .instrument(db_span!("INSERT", query))
                    .await
                    .map_err(|err| map_unique_violation(err, &rule.name))?
            }
            Some(id) => {
                let query = "UPDATE event_rules SET name = $2, events = $3, handler = $4, \
                             action = $5, position = $6, conditions = $7, options = $8, \
                             active = $9, ordering = $10, updated_at = NOW() \
                             WHERE id = $1 RETURNING id";
                sqlx::query_scalar::<_, i64>(query)
                    .bind(id)
                    .bind(&rule.name)
                    .bind(&rule.events)
                    .bind(&rule.handler)
                    .bind(&rule.action)
                    .bind(rule.position.as_str())
                    .bind(Json(&rule.conditions))
                    .bind(Json(&rule.options))
                    .bind(rule.active)
                    .bind(rule.ordering)
                    .fetch_optional(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await
                    .map_err(|err| map_unique_violation(err, &rule.name))?
                    .ok_or_else(|| StoreError::NotFound {
                        kind: "rule",
                        id: id.to_string(),
                    })?
            }
        };

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let query = "DELETE FROM event_rules WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&mut *tx)
            .instrument(db_span!("DELETE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "rule",
                id: id.to_string(),
            });
        }
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let query = "UPDATE event_rules SET active = $2, updated_at = NOW() WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(active)
            .execute(&mut *tx)
            .instrument(db_span!("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "rule",
                id: id.to_string(),
            });
        }
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn config_version(&self) -> Result<i64, StoreError> {
        let query = "SELECT version FROM event_config WHERE id = 1";
        let version: Option<i64> = sqlx::query_scalar(query)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?;
        Ok(version.unwrap_or(0))
    }
}

/// Tokens and users in Postgres.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: &PgRow) -> Result<Token, StoreError> {
        let serial: String = row.try_get("serial")?;
        let owner_login: Option<String> = row.try_get("owner_login")?;
        let owner_realm: Option<String> = row.try_get("owner_realm")?;
        let owner_resolver: Option<String> = row.try_get("owner_resolver")?;

        let query = "SELECT realm FROM token_realms WHERE serial = $1 ORDER BY realm";
        let realms: Vec<String> = sqlx::query_scalar(query)
            .bind(&serial)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?;

        let query = "SELECT key, value FROM tokeninfo WHERE serial = $1";
        let info = sqlx::query_as::<_, (String, String)>(query)
            .bind(&serial)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?
            .into_iter()
            .collect();

        let query = "SELECT tokengroup FROM token_groups WHERE serial = $1";
        let groups: Vec<String> = sqlx::query_scalar(query)
            .bind(&serial)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?;

        Ok(Token {
            tokentype: row.try_get("tokentype")?,
            description: row.try_get("description")?,
            active: row.try_get("active")?,
            owner: owner_login.map(|login| {
                UserRef::new(login, owner_realm.unwrap_or_default())
                    .with_resolver(owner_resolver.unwrap_or_default())
            }),
            realms,
            fail_count: row.try_get("fail_count")?,
            max_fail: row.try_get("max_fail")?,
            otp_counter: row.try_get("otp_counter")?,
            count_window: row.try_get("count_window")?,
            validity_start: row.try_get("validity_start")?,
            validity_end: row.try_get("validity_end")?,
            rollout_state: row.try_get("rollout_state")?,
            info,
            groups: groups.into_iter().collect(),
            serial,
        })
    }

    async fn execute(
        &self,
        query: &'static str,
        serial: &str,
        operation: &'static str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(query)
            .bind(serial)
            .execute(&self.pool)
            .instrument(db_span!(operation, query))
            .await?;
        Ok(result.rows_affected())
    }
}

const TOKEN_COLUMNS: &str = "serial, tokentype, description, active, owner_login, owner_realm, \
     owner_resolver, fail_count, max_fail, otp_counter, count_window, validity_start, \
     validity_end, rollout_state";

#[async_trait]
impl TokenStore for PgDirectory {
    async fn token(&self, serial: &str) -> Result<Option<Token>, StoreError> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE serial = $1");
        let row = sqlx::query(&query)
            .bind(serial)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn tokens_for_user(&self, user: &UserRef) -> Result<Vec<Token>, StoreError> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE owner_login = $1 AND owner_realm = $2 \
             ORDER BY serial"
        );
        let rows = sqlx::query(&query)
            .bind(&user.login)
            .bind(&user.realm)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await?;
        let mut tokens = Vec::with_capacity(rows.len());
        for row in &rows {
            tokens.push(self.hydrate(row).await?);
        }
        Ok(tokens)
    }

    async fn create_token(&self, token: Token) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let query = "INSERT INTO tokens (serial, tokentype, description, active, owner_login, \
                     owner_realm, owner_resolver, rollout_state) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";
        sqlx::query(query)
            .bind(&token.serial)
            .bind(&token.tokentype)
            .bind(&token.description)
            .bind(token.active)
            .bind(token.owner.as_ref().map(|owner| owner.login.as_str()))
            .bind(token.owner.as_ref().map(|owner| owner.realm.as_str()))
            .bind(token.owner.as_ref().map(|owner| owner.resolver.as_str()))
            .bind(&token.rollout_state)
            .execute(&mut *tx)
            .instrument(db_span!("INSERT", query))
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                    StoreError::Conflict(format!("token {} already exists", token.serial))
                }
                _ => StoreError::Database(err),
            })?;

        let query = "INSERT INTO token_realms (serial, realm) VALUES ($1, $2)";
        for realm in &token.realms {
            sqlx::query(query)
                .bind(&token.serial)
                .bind(realm)
                .execute(&mut *tx)
                .instrument(db_span!("INSERT", query))
                .await?;
        }

        let query = "INSERT INTO tokeninfo (serial, key, value) VALUES ($1, $2, $3)";
        for (key, value) in &token.info {
            sqlx::query(query)
                .bind(&token.serial)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .instrument(db_span!("INSERT", query))
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_token(&self, serial: &str) -> Result<(), StoreError> {
        if self
            .execute("DELETE FROM tokens WHERE serial = $1", serial, "DELETE")
            .await?
            == 0
        {
            return Err(StoreError::NotFound {
                kind: "token",
                id: serial.to_string(),
            });
        }
        Ok(())
    }

    async fn update_token(&self, serial: &str, mutation: TokenMutation) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = "SELECT serial FROM tokens WHERE serial = $1 FOR UPDATE";
        let exists: Option<String> = sqlx::query_scalar(query)
            .bind(serial)
            .fetch_optional(&mut *tx)
            .instrument(db_span!("SELECT", query))
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                kind: "token",
                id: serial.to_string(),
            });
        }

        match mutation {
            TokenMutation::SetRealms(realms) => {
                let query = "DELETE FROM token_realms WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .execute(&mut *tx)
                    .instrument(db_span!("DELETE", query))
                    .await?;
                let query = "INSERT INTO token_realms (serial, realm) VALUES ($1, $2) \
                             ON CONFLICT DO NOTHING";
                for realm in &realms {
                    sqlx::query(query)
                        .bind(serial)
                        .bind(realm)
                        .execute(&mut *tx)
                        .instrument(db_span!("INSERT", query))
                        .await?;
                }
            }
            TokenMutation::AddRealm(realm) => {
                let query = "INSERT INTO token_realms (serial, realm) VALUES ($1, $2) \
                             ON CONFLICT DO NOTHING";
                sqlx::query(query)
                    .bind(serial)
                    .bind(realm)
                    .execute(&mut *tx)
                    .instrument(db_span!("INSERT", query))
                    .await?;
            }
            TokenMutation::SetActive(active) => {
                let query = "UPDATE tokens SET active = $2 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(active)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::Unassign => {
                let query = "UPDATE tokens SET owner_login = NULL, owner_realm = NULL, \
                             owner_resolver = NULL, fail_count = 0 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::SetDescription(description) => {
                let query = "UPDATE tokens SET description = $2 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(description)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::SetValidity { start, end } => {
                let query =
                    "UPDATE tokens SET validity_start = $2, validity_end = $3 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(start)
                    .bind(end)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::SetCountWindow(window) => {
                let query = "UPDATE tokens SET count_window = $2 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(window)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::SetFailCount(count) => {
                let query = "UPDATE tokens SET fail_count = $2 WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(count)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::ChangeFailCount(delta) => {
                let query =
                    "UPDATE tokens SET fail_count = GREATEST(fail_count + $2, 0) WHERE serial = $1";
                sqlx::query(query)
                    .bind(serial)
                    .bind(delta)
                    .execute(&mut *tx)
                    .instrument(db_span!("UPDATE", query))
                    .await?;
            }
            TokenMutation::SetInfo { key, value } => {
                let query = "INSERT INTO tokeninfo (serial, key, value) VALUES ($1, $2, $3) \
                             ON CONFLICT (serial, key) DO UPDATE SET value = EXCLUDED.value";
                sqlx::query(query)
                    .bind(serial)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .instrument(db_span!("INSERT", query))
                    .await?;
            }
            TokenMutation::DeleteInfo(key) => {
                let query = "DELETE FROM tokeninfo WHERE serial = $1 AND key = $2";
                sqlx::query(query)
                    .bind(serial)
                    .bind(key)
                    .execute(&mut *tx)
                    .instrument(db_span!("DELETE", query))
                    .await?;
            }
            TokenMutation::AddGroup(group) => {
                let query = "INSERT INTO token_groups (serial, tokengroup) VALUES ($1, $2) \
                             ON CONFLICT DO NOTHING";
                sqlx::query(query)
                    .bind(serial)
                    .bind(group)
                    .execute(&mut *tx)
                    .instrument(db_span!("INSERT", query))
                    .await?;
            }
            TokenMutation::RemoveGroup(group) => {
                let query = "DELETE FROM token_groups WHERE serial = $1 AND tokengroup = $2";
                sqlx::query(query)
                    .bind(serial)
                    .bind(group)
                    .execute(&mut *tx)
                    .instrument(db_span!("DELETE", query))
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgDirectory {
    async fn user(&self, login: &str, realm: &str) -> Result<Option<User>, StoreError> {
        let query = "SELECT login, realm, resolver, surname, givenname, email FROM users \
                     WHERE login = $1 AND realm = $2";
        let Some(row) = sqlx::query(query)
            .bind(login)
            .bind(realm)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?
        else {
            return Ok(None);
        };

        let query = "SELECT key, value FROM user_attributes WHERE login = $1 AND realm = $2";
        let attributes = sqlx::query_as::<_, (String, String)>(query)
            .bind(login)
            .bind(realm)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await?
            .into_iter()
            .collect();

        Ok(Some(User {
            login: row.try_get("login")?,
            realm: row.try_get("realm")?,
            resolver: row.try_get("resolver")?,
            surname: row.try_get("surname")?,
            givenname: row.try_get("givenname")?,
            email: row.try_get("email")?,
            attributes,
        }))
    }

    async fn set_attribute(&self, user: &UserRef, key: &str, value: &str) -> Result<(), StoreError> {
        let query = "INSERT INTO user_attributes (login, realm, key, value) \
                     SELECT login, realm, $3, $4 FROM users WHERE login = $1 AND realm = $2 \
                     ON CONFLICT (login, realm, key) DO UPDATE SET value = EXCLUDED.value";
        let result = sqlx::query(query)
            .bind(&user.login)
            .bind(&user.realm)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "user",
                id: format!("{}@{}", user.login, user.realm),
            });
        }
        Ok(())
    }

    async fn delete_attribute(&self, user: &UserRef, key: &str) -> Result<(), StoreError> {
        let query = "DELETE FROM user_attributes WHERE login = $1 AND realm = $2 AND key = $3";
        sqlx::query(query)
            .bind(&user.login)
            .bind(&user.realm)
            .bind(key)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await?;
        Ok(())
    }
}
