//! In-memory stores for tests and embedders without a database.

use super::{
    CounterStore, RuleStore, StoreError, Token, TokenMutation, TokenStore, User, UserRef,
    UserStore,
};
use crate::events::rule::EventRule;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increase(&self, name: &str) -> Result<i64, StoreError> {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(name.to_string()).or_insert(0);
        *value = value.saturating_add(1);
        Ok(*value)
    }

    async fn decrease(&self, name: &str, allow_negative: bool) -> Result<i64, StoreError> {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(name.to_string()).or_insert(0);
        if allow_negative || *value > 0 {
            *value = value.saturating_sub(1);
        }
        Ok(*value)
    }

    async fn reset(&self, name: &str) -> Result<(), StoreError> {
        self.counters.lock().await.insert(name.to_string(), 0);
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<i64, StoreError> {
        Ok(self.counters.lock().await.get(name).copied().unwrap_or(0))
    }
}

/// Tokens and users kept in maps; implements both directory traits.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    tokens: Mutex<BTreeMap<String, Token>>,
    users: Mutex<BTreeMap<(String, String), User>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users
            .lock()
            .await
            .insert((user.login.clone(), user.realm.clone()), user);
    }

    pub async fn insert_token(&self, token: Token) {
        self.tokens.lock().await.insert(token.serial.clone(), token);
    }

    pub async fn remove_user(&self, login: &str, realm: &str) {
        self.users
            .lock()
            .await
            .remove(&(login.to_string(), realm.to_string()));
    }
}

#[async_trait]
impl TokenStore for MemoryDirectory {
    async fn token(&self, serial: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.tokens.lock().await.get(serial).cloned())
    }

    async fn tokens_for_user(&self, user: &UserRef) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .tokens
            .lock()
            .await
            .values()
            .filter(|token| {
                token
                    .owner
                    .as_ref()
                    .is_some_and(|owner| owner.login == user.login && owner.realm == user.realm)
            })
            .cloned()
            .collect())
    }

    async fn create_token(&self, token: Token) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(&token.serial) {
            return Err(StoreError::Conflict(format!(
                "token {} already exists",
                token.serial
            )));
        }
        tokens.insert(token.serial.clone(), token);
        Ok(())
    }

    async fn delete_token(&self, serial: &str) -> Result<(), StoreError> {
        self.tokens
            .lock()
            .await
            .remove(serial)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "token",
                id: serial.to_string(),
            })
    }

    async fn update_token(&self, serial: &str, mutation: TokenMutation) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().await;
        let token = tokens.get_mut(serial).ok_or_else(|| StoreError::NotFound {
            kind: "token",
            id: serial.to_string(),
        })?;
        token.apply(&mutation);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryDirectory {
    async fn user(&self, login: &str, realm: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .lock()
            .await
            .get(&(login.to_string(), realm.to_string()))
            .cloned())
    }

    async fn set_attribute(&self, user: &UserRef, key: &str, value: &str) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let entry = users
            .get_mut(&(user.login.clone(), user.realm.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind: "user",
                id: format!("{}@{}", user.login, user.realm),
            })?;
        entry.attributes.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_attribute(&self, user: &UserRef, key: &str) -> Result<(), StoreError> {
        if let Some(entry) = self
            .users
            .lock()
            .await
            .get_mut(&(user.login.clone(), user.realm.clone()))
        {
            entry.attributes.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryRuleStore {
    rules: Mutex<BTreeMap<i64, EventRule>>,
    next_id: AtomicI64,
    version: AtomicI64,
}

impl MemoryRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            version: AtomicI64::new(1),
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list(&self) -> Result<Vec<EventRule>, StoreError> {
        Ok(self.rules.lock().await.values().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Option<EventRule>, StoreError> {
        Ok(self.rules.lock().await.get(&id).cloned())
    }

    async fn save(&self, rule: &EventRule) -> Result<i64, StoreError> {
        let mut rules = self.rules.lock().await;
        if rules
            .values()
            .any(|existing| existing.name == rule.name && existing.id != rule.id)
        {
            return Err(StoreError::Conflict(format!(
                "rule {} already exists",
                rule.name
            )));
        }
        let id = match rule.id {
            Some(id) if rules.contains_key(&id) => id,
            Some(id) => {
                return Err(StoreError::NotFound {
                    kind: "rule",
                    id: id.to_string(),
                });
            }
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let mut stored = rule.clone();
        stored.id = Some(id);
        rules.insert(id, stored);
        self.bump();
        Ok(id)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.rules
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "rule",
                id: id.to_string(),
            })?;
        self.bump();
        Ok(())
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let mut rules = self.rules.lock().await;
        let rule = rules.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "rule",
            id: id.to_string(),
        })?;
        rule.active = active;
        self.bump();
        Ok(())
    }

    async fn config_version(&self) -> Result<i64, StoreError> {
        Ok(self.version.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::rule::Position;
    use std::sync::Arc;

    #[tokio::test]
    async fn counters_are_atomic_under_concurrency() -> Result<(), StoreError> {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.increase("hits").await }));
        }
        for handle in handles {
            if let Ok(result) = handle.await {
                result?;
            }
        }
        assert_eq!(store.read("hits").await?, 50);
        Ok(())
    }

    #[tokio::test]
    async fn decrease_clamps_unless_negative_allowed() -> Result<(), StoreError> {
        let store = MemoryCounterStore::new();
        assert_eq!(store.read("missing").await?, 0);
        assert_eq!(store.decrease("c", false).await?, 0);
        assert_eq!(store.decrease("c", true).await?, -1);
        store.reset("c").await?;
        assert_eq!(store.read("c").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rule_writes_bump_version() -> Result<(), StoreError> {
        let store = MemoryRuleStore::new();
        let v0 = store.config_version().await?;
        let id = store
            .save(&EventRule::new("r1", &["*"], "logging", "logging", Position::Post))
            .await?;
        let v1 = store.config_version().await?;
        assert!(v1 > v0);
        store.set_active(id, false).await?;
        assert!(store.config_version().await? > v1);
        assert_eq!(store.get(id).await?.map(|rule| rule.active), Some(false));

        let duplicate = store
            .save(&EventRule::new("r1", &["*"], "logging", "logging", Position::Post))
            .await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

        store.delete(id).await?;
        assert!(store.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn directory_mutations() -> Result<(), StoreError> {
        let directory = MemoryDirectory::new();
        let mut token = Token::new("HOTP1", "hotp");
        token.owner = Some(UserRef::new("alice", "wonderland"));
        directory.create_token(token).await?;

        let owned = directory
            .tokens_for_user(&UserRef::new("alice", "wonderland"))
            .await?;
        assert_eq!(owned.len(), 1);

        directory
            .update_token("HOTP1", TokenMutation::SetActive(false))
            .await?;
        assert_eq!(
            directory.token("HOTP1").await?.map(|token| token.active),
            Some(false)
        );

        directory.delete_token("HOTP1").await?;
        assert!(directory.token("HOTP1").await?.is_none());
        Ok(())
    }
}
