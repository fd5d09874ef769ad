use authevents::events::handlers::{self, HandlerConfig};
use authevents::events::registry::Services;
use authevents::events::store::{
    CounterStore, MemoryCounterStore, MemoryDirectory, MemoryRuleStore, RuleStore, Token,
    TokenStore, User, UserStore,
};
use authevents::events::{
    Actor, EventContext, EventEngine, EventRule, Position, RequestSnapshot, ResponseSnapshot, Role,
};
use axum::{Json, Router, extract::State, routing::post};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Harness {
    engine: Arc<EventEngine>,
    rules: Arc<MemoryRuleStore>,
    directory: Arc<MemoryDirectory>,
    counters: Arc<MemoryCounterStore>,
}

impl Harness {
    fn new(config: &HandlerConfig) -> Result<Self, reqwest::Error> {
        let rules = Arc::new(MemoryRuleStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let services = Services {
            tokens: directory.clone(),
            users: directory.clone(),
            counters: counters.clone(),
        };
        let engine = EventEngine::new(handlers::builtin(config)?, rules.clone(), services);
        Ok(Self {
            engine: Arc::new(engine),
            rules,
            directory,
            counters,
        })
    }

    fn plain() -> Result<Self, reqwest::Error> {
        Self::new(&HandlerConfig::default())
    }

    async fn add(&self, rule: EventRule) -> Result<i64, Box<dyn std::error::Error>> {
        self.engine.registry().validate(&rule)?;
        Ok(self.rules.save(&rule).await?)
    }
}

fn counting_rule(name: &str, event: &str, position: Position) -> EventRule {
    EventRule::new(name, &[event], "counter", "increase_counter", position)
        .with_option("counter_name", name)
}

fn user(login: &str, realm: &str) -> User {
    User {
        login: login.to_string(),
        realm: realm.to_string(),
        resolver: "ldap".to_string(),
        surname: "Liddell".to_string(),
        givenname: "Alice".to_string(),
        email: format!("{login}@{realm}.example"),
        ..User::default()
    }
}

fn owned_token(serial: &str, tokentype: &str, owner: &User) -> Token {
    let mut token = Token::new(serial, tokentype);
    token.owner = Some(owner.user_ref());
    token.realms = vec![owner.realm.clone()];
    token
}

fn validate_check(user: &User) -> EventContext {
    EventContext::new(
        "validate_check",
        RequestSnapshot::new("POST", "/validate/check")
            .with_param("user", &user.login)
            .with_param("realm", &user.realm),
    )
}

/// Serve `router` on an ephemeral local port.
async fn serve(router: Router) -> Result<SocketAddr, std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    Ok(addr)
}

#[tokio::test]
async fn failed_results_are_logged_for_every_event() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(
            EventRule::new("log-failures", &["*"], "logging", "logging", Position::Post)
                .with_condition("result_value", "False"),
        )
        .await?;

    let mut ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"))
        .with_response(ResponseSnapshot::json(
            200,
            json!({"result": {"value": false, "status": false}}),
        ));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(ctx.audit.len(), 1);
    assert_eq!(ctx.audit[0].rule, "log-failures");
    assert!(ctx.audit[0].success);

    let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/"))
        .with_response(ResponseSnapshot::json(
            200,
            json!({"result": {"value": true, "status": true}}),
        ));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert!(ctx.audit.is_empty());
    Ok(())
}

#[tokio::test]
async fn serial_condition_matches_prefix() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(
            counting_rule("oath", "validate_check", Position::Post)
                .with_condition("serial", "^OATH.*"),
        )
        .await?;

    let mut ctx = EventContext::new(
        "validate_check",
        RequestSnapshot::new("POST", "/").with_param("serial", "OATH123456"),
    );
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    let mut ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"))
        .with_response(ResponseSnapshot::json(
            200,
            json!({"detail": {"serial": "OATH999"}}),
        ));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    let mut ctx = EventContext::new(
        "validate_check",
        RequestSnapshot::new("POST", "/").with_param("serial", "TOTP0001"),
    );
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    assert_eq!(harness.counters.read("oath").await?, 2);
    Ok(())
}

#[tokio::test]
async fn rules_run_in_declared_order() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(
            EventRule::new("z-first", &["token_init"], "logging", "logging", Position::Pre)
                .with_ordering(1),
        )
        .await?;
    harness
        .add(
            EventRule::new("a-second", &["token_init"], "logging", "logging", Position::Pre)
                .with_ordering(2),
        )
        .await?;

    for _ in 0..10 {
        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        harness.engine.dispatch(&mut ctx, Position::Pre).await?;
        let order: Vec<&str> = ctx.audit.iter().map(|entry| entry.rule.as_str()).collect();
        assert_eq!(order, vec!["z-first", "a-second"]);
    }
    Ok(())
}

#[cfg(unix)]
mod scripts {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn script_dir(name: &str, body: &str) -> Result<PathBuf, std::io::Error> {
        let dir = std::env::temp_dir().join(format!("authevents-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(dir)
    }

    #[tokio::test]
    async fn failing_script_with_raise_error_aborts() -> TestResult {
        let dir = script_dir("fail.sh", "#!/bin/sh\nexit 3\n")?;
        let harness = Harness::new(&HandlerConfig {
            script_dir: Some(dir.clone()),
            ..HandlerConfig::default()
        })?;
        harness
            .add(
                EventRule::new("guard", &["token_init"], "script", "fail.sh", Position::Pre)
                    .with_option("background", "wait")
                    .with_option("raise_error", "true"),
            )
            .await?;
        harness
            .add(counting_rule("after-guard", "token_init", Position::Pre).with_ordering(5))
            .await?;

        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        let result = harness.engine.dispatch(&mut ctx, Position::Pre).await;
        let err = result.err().ok_or("dispatch should fail")?;
        assert_eq!(err.rule, "guard");
        assert_eq!(harness.counters.read("after-guard").await?, 0);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[tokio::test]
    async fn failing_script_without_raise_error_is_isolated() -> TestResult {
        let dir = script_dir("fail.sh", "#!/bin/sh\nexit 3\n")?;
        let harness = Harness::new(&HandlerConfig {
            script_dir: Some(dir.clone()),
            ..HandlerConfig::default()
        })?;
        harness
            .add(
                EventRule::new("notify", &["token_init"], "script", "fail.sh", Position::Post)
                    .with_option("background", "wait"),
            )
            .await?;
        harness
            .add(counting_rule("after-notify", "token_init", Position::Post).with_ordering(5))
            .await?;

        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        harness.engine.dispatch(&mut ctx, Position::Post).await?;
        assert!(!ctx.audit[0].success);
        assert_eq!(harness.counters.read("after-notify").await?, 1);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[tokio::test]
    async fn hard_failures_become_server_errors() -> TestResult {
        let dir = script_dir("deny.sh", "#!/bin/sh\nexit 1\n")?;
        let harness = Harness::new(&HandlerConfig {
            script_dir: Some(dir.clone()),
            ..HandlerConfig::default()
        })?;
        harness
            .add(
                EventRule::new("deny", &["event_list"], "script", "deny.sh", Position::Pre)
                    .with_option("background", "wait")
                    .with_option("raise_error", "true"),
            )
            .await?;
        let addr = serve(authevents::api::app(harness.engine.clone(), 64 * 1024)).await?;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/v1/events"))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json().await?;
        assert_eq!(body["result"]["status"], json!(false));

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[tokio::test]
    async fn slow_scripts_are_killed_at_the_timeout() -> TestResult {
        let dir = script_dir("slow.sh", "#!/bin/sh\nexec sleep 5\n")?;
        let harness = Harness::new(&HandlerConfig {
            script_dir: Some(dir.clone()),
            script_timeout: Duration::from_secs(1),
            ..HandlerConfig::default()
        })?;
        harness
            .add(
                EventRule::new("slow", &["token_init"], "script", "slow.sh", Position::Post)
                    .with_option("background", "wait"),
            )
            .await?;
        harness
            .add(
                EventRule::new("slow-guard", &["token_init"], "script", "slow.sh", Position::Pre)
                    .with_option("background", "wait")
                    .with_option("raise_error", "true"),
            )
            .await?;

        let started = Instant::now();
        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        harness.engine.dispatch(&mut ctx, Position::Post).await?;
        assert!(!ctx.audit[0].success);
        assert!(started.elapsed() < Duration::from_secs(4));

        let started = Instant::now();
        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        let err = harness
            .engine
            .dispatch(&mut ctx, Position::Pre)
            .await
            .err()
            .ok_or("timed out script should abort")?;
        assert_eq!(err.rule, "slow-guard");
        assert!(err.message.contains("did not finish"));
        assert!(started.elapsed() < Duration::from_secs(4));

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[tokio::test]
    async fn background_scripts_do_not_block_dispatch() -> TestResult {
        let dir = script_dir("notify.sh", "#!/bin/sh\nsleep 2\ntouch \"$0.done\"\n")?;
        let marker = dir.join("notify.sh.done");
        let harness = Harness::new(&HandlerConfig {
            script_dir: Some(dir.clone()),
            ..HandlerConfig::default()
        })?;
        harness
            .add(
                EventRule::new("notify", &["token_init"], "script", "notify.sh", Position::Post)
                    .with_option("background", "background"),
            )
            .await?;

        let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
        harness.engine.dispatch(&mut ctx, Position::Post).await?;
        assert!(ctx.audit[0].success);
        assert!(!marker.exists());

        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(marker.exists());

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}

#[tokio::test]
async fn token_locked_scans_all_user_tokens() -> TestResult {
    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    let mut locked = owned_token("HOTP0001", "hotp", &alice);
    locked.fail_count = locked.max_fail;
    harness.directory.insert_token(locked).await;
    harness
        .directory
        .insert_token(owned_token("HOTP0002", "hotp", &alice))
        .await;
    harness
        .add(
            counting_rule("locked", "validate_check", Position::Post)
                .with_condition("token_locked", "True"),
        )
        .await?;

    let mut ctx = validate_check(&alice);
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("locked").await?, 1);

    let mut ctx = validate_check(&alice);
    ctx.request.params.insert("serial".to_string(), "HOTP0002".to_string());
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("locked").await?, 1);
    Ok(())
}

#[tokio::test]
async fn token_conditions_need_a_single_token() -> TestResult {
    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    harness
        .directory
        .insert_token(owned_token("HOTP0001", "hotp", &alice))
        .await;
    harness
        .add(
            counting_rule("hotp", "validate_check", Position::Post)
                .with_condition("tokentype", "hotp")
                .with_condition("token_has_owner", "True"),
        )
        .await?;

    let mut ctx = validate_check(&alice);
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("hotp").await?, 1);

    harness
        .directory
        .insert_token(owned_token("HOTP0002", "hotp", &alice))
        .await;
    let mut ctx = validate_check(&alice);
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("hotp").await?, 1);
    Ok(())
}

#[tokio::test]
async fn counter_condition_reads_persistent_counters() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(counting_rule("attempts", "validate_check", Position::Pre))
        .await?;
    harness
        .add(
            EventRule::new("flood", &["validate_check"], "counter", "reset_counter", Position::Post)
                .with_option("counter_name", "attempts")
                .with_condition("counter", "attempts>2"),
        )
        .await?;

    for expected in [1, 2, 0, 1] {
        let mut ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"));
        harness.engine.dispatch(&mut ctx, Position::Pre).await?;
        harness.engine.dispatch(&mut ctx, Position::Post).await?;
        assert_eq!(harness.counters.read("attempts").await?, expected);
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_webhook_reports_failure() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(
            EventRule::new("hook", &["token_init"], "webhook", "post_webhook", Position::Post)
                .with_option("URL", "http://127.0.0.1:1/hook"),
        )
        .await?;
    harness
        .add(counting_rule("after-hook", "token_init", Position::Post).with_ordering(1))
        .await?;

    let mut ctx = EventContext::new("token_init", RequestSnapshot::new("POST", "/token/init"));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert!(!ctx.audit[0].success);
    assert_eq!(harness.counters.read("after-hook").await?, 1);
    Ok(())
}

/// Local endpoint collecting JSON payloads.
async fn receiver() -> Result<(SocketAddr, Arc<Mutex<Vec<Value>>>), std::io::Error> {
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let target = Router::new()
        .route(
            "/hook",
            post(
                |State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    received.lock().await.push(body);
                    Json(json!({"ok": true}))
                },
            ),
        )
        .with_state(received.clone());
    Ok((serve(target).await?, received))
}

#[tokio::test]
async fn webhook_escapes_directory_values() -> TestResult {
    let (addr, received) = receiver().await?;
    let harness = Harness::plain()?;
    harness
        .add(
            EventRule::new("hook", &["validate_check"], "webhook", "post_webhook", Position::Post)
                .with_option("URL", &format!("http://{addr}/hook"))
                .with_option("replace", "true")
                .with_option("data", r#"{"surname": "{surname}"}"#),
        )
        .await?;

    let surnames = [r#"O"Brien"#, r#"x", "role": "admin"#];
    for (n, surname) in surnames.iter().enumerate() {
        let person = User {
            surname: (*surname).to_string(),
            ..user(&format!("user{n}"), "wonderland")
        };
        harness.directory.insert_user(person.clone()).await;
        let mut ctx = validate_check(&person);
        harness.engine.dispatch(&mut ctx, Position::Post).await?;
        assert!(ctx.audit[0].success);
    }

    assert_eq!(
        received.lock().await.as_slice(),
        &[
            json!({"surname": r#"O"Brien"#}),
            json!({"surname": r#"x", "role": "admin"#}),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn orphaned_tokens_after_owner_removal() -> TestResult {
    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    harness
        .directory
        .insert_token(owned_token("HOTP0001", "hotp", &alice))
        .await;
    harness
        .add(
            counting_rule("orphans", "token_init", Position::Post)
                .with_condition("token_is_orphaned", "True"),
        )
        .await?;

    let request = RequestSnapshot::new("POST", "/token/init").with_param("serial", "HOTP0001");
    let mut ctx = EventContext::new("token_init", request.clone());
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("orphans").await?, 0);

    harness.directory.remove_user("alice", "wonderland").await;
    let mut ctx = EventContext::new("token_init", request);
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert_eq!(harness.counters.read("orphans").await?, 1);
    Ok(())
}

#[tokio::test]
async fn webhook_posts_rendered_payload() -> TestResult {
    let (addr, received) = receiver().await?;

    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    harness
        .add(
            EventRule::new("hook", &["token_init"], "webhook", "post_webhook", Position::Post)
                .with_option("URL", &format!("http://{addr}/hook"))
                .with_option("replace", "true")
                .with_option("data", r#"{"user": "{user}", "by": "{logged_in_user}"}"#),
        )
        .await?;

    let mut ctx = validate_check(&alice);
    ctx.event = "token_init".to_string();
    let mut ctx = ctx.with_actor(Actor {
        username: "admin".to_string(),
        realm: "super".to_string(),
        role: Role::Admin,
    });
    harness.engine.dispatch(&mut ctx, Position::Post).await?;
    assert!(ctx.audit[0].success);
    assert_eq!(
        received.lock().await.as_slice(),
        &[json!({"user": "alice", "by": "admin"})]
    );
    Ok(())
}

#[tokio::test]
async fn response_mangler_rewrites_post_response() -> TestResult {
    let harness = Harness::plain()?;
    harness
        .add(
            EventRule::new("hide", &["validate_check"], "responsemangler", "delete", Position::Post)
                .with_option("JSON pointer", "/detail/serial"),
        )
        .await?;
    harness
        .add(
            EventRule::new("note", &["validate_check"], "responsemangler", "set", Position::Post)
                .with_option("JSON pointer", "/detail/extra/attempts")
                .with_option("value", "3")
                .with_option("type", "integer"),
        )
        .await?;

    let mut ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"))
        .with_response(ResponseSnapshot::json(
            200,
            json!({"result": {"value": true}, "detail": {"serial": "OATH1"}}),
        ));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    let body = ctx.response.and_then(|response| response.body);
    assert_eq!(
        body,
        Some(json!({"result": {"value": true}, "detail": {"extra": {"attempts": 3}}}))
    );
    Ok(())
}

#[tokio::test]
async fn response_mangler_is_post_only() -> TestResult {
    let harness = Harness::plain()?;
    let rule = EventRule::new("early", &["validate_check"], "responsemangler", "delete", Position::Pre)
        .with_option("JSON pointer", "/detail");
    assert!(harness.engine.registry().validate(&rule).is_err());
    Ok(())
}

#[tokio::test]
async fn federation_at_pre_supplies_the_response() -> TestResult {
    let target = Router::new().route(
        "/validate/check",
        post(|| async { Json(json!({"result": {"status": true, "value": true}})) }),
    );
    let addr = serve(target).await?;

    let remote: url::Url = format!("http://{addr}/").parse()?;
    let harness = Harness::new(&HandlerConfig {
        remote_servers: [("remote".to_string(), remote)].into(),
        ..HandlerConfig::default()
    })?;
    harness
        .add(
            EventRule::new("forward", &["validate_check"], "federation", "forward", Position::Pre)
                .with_option("remote", "remote")
                .with_condition("realm", "remote-users"),
        )
        .await?;

    let mut ctx = validate_check(&user("bob", "remote-users"));
    harness.engine.dispatch(&mut ctx, Position::Pre).await?;
    let response = ctx.response.ok_or("federation should set a response")?;
    assert_eq!(response.lookup(&["result", "value"]), Some(&json!(true)));
    assert_eq!(
        response.lookup_str(&["detail", "origin"]),
        Some(format!("http://{addr}/validate/check").as_str())
    );
    Ok(())
}

#[tokio::test]
async fn custom_attributes_follow_the_token_owner() -> TestResult {
    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    harness
        .directory
        .insert_token(owned_token("TOTP0001", "totp", &alice))
        .await;
    harness
        .add(
            EventRule::new(
                "mark",
                &["token_init"],
                "custom_user_attributes",
                "set_custom_user_attributes",
                Position::Post,
            )
            .with_option("user", "tokenowner")
            .with_option("attrkey", "enrolled")
            .with_option("attrvalue", "yes"),
        )
        .await?;

    let mut ctx = EventContext::new(
        "token_init",
        RequestSnapshot::new("POST", "/token/init").with_param("serial", "TOTP0001"),
    );
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    let stored = harness
        .directory
        .user("alice", "wonderland")
        .await?
        .ok_or("user should exist")?;
    assert_eq!(stored.info("enrolled"), Some("yes"));
    Ok(())
}

#[tokio::test]
async fn token_actions_change_the_resolved_token() -> TestResult {
    let harness = Harness::plain()?;
    let alice = user("alice", "wonderland");
    harness.directory.insert_user(alice.clone()).await;
    harness
        .directory
        .insert_token(owned_token("HOTP0001", "hotp", &alice))
        .await;
    harness
        .add(
            EventRule::new("disable", &["validate_check"], "token", "disable", Position::Post)
                .with_condition("result_value", "False"),
        )
        .await?;
    harness
        .add(
            EventRule::new("note", &["validate_check"], "token", "set_tokeninfo", Position::Post)
                .with_option("key", "flagged")
                .with_option("value", "true")
                .with_condition("result_value", "False"),
        )
        .await?;

    let mut ctx = validate_check(&alice).with_response(ResponseSnapshot::json(
        200,
        json!({"result": {"status": true, "value": false}}),
    ));
    harness.engine.dispatch(&mut ctx, Position::Post).await?;

    let token = harness
        .directory
        .token("HOTP0001")
        .await?
        .ok_or("token should exist")?;
    assert!(!token.active);
    assert_eq!(token.info.get("flagged").map(String::as_str), Some("true"));
    Ok(())
}

#[tokio::test]
async fn rule_changes_invalidate_the_cache() -> TestResult {
    let harness = Harness::plain()?;
    let id = harness
        .add(counting_rule("hits", "validate_check", Position::Pre))
        .await?;

    let mut ctx = EventContext::new("validate_check", RequestSnapshot::new("POST", "/"));
    harness.engine.dispatch(&mut ctx, Position::Pre).await?;
    harness.rules.set_active(id, false).await?;
    harness.engine.dispatch(&mut ctx, Position::Pre).await?;

    assert_eq!(harness.counters.read("hits").await?, 1);
    Ok(())
}

mod http {
    use super::*;
    use authevents::api;

    const MAX_BODY: usize = 64 * 1024;

    async fn audit_rules(harness: &Harness, count: usize) -> Result<(), Box<dyn std::error::Error>> {
        for n in 0..count {
            harness
                .add(EventRule::new(
                    format!("audit-{n}"),
                    &["token_init"],
                    "logging",
                    "logging",
                    Position::Post,
                ))
                .await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn responses_without_post_rules_are_not_buffered() -> TestResult {
        let harness = Harness::plain()?;
        audit_rules(&harness, 5).await?;
        let addr = serve(api::app(harness.engine.clone(), 512)).await?;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/v1/events"))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await?;
        assert_eq!(body["result"]["value"].as_array().map(Vec::len), Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn large_responses_stream_through_post_rules() -> TestResult {
        let harness = Harness::plain()?;
        audit_rules(&harness, 5).await?;
        harness
            .add(counting_rule("listed", "event_list", Position::Post))
            .await?;
        let addr = serve(api::app(harness.engine.clone(), 512)).await?;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/v1/events"))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await?;
        assert_eq!(body["result"]["value"].as_array().map(Vec::len), Some(6));
        assert_eq!(harness.counters.read("listed").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn hooks_mangle_admin_requests_and_responses() -> TestResult {
        let harness = Harness::plain()?;
        harness
            .add(
                EventRule::new("force-order", &["event_save"], "requestmangler", "set", Position::Pre)
                    .with_option("parameter", "ordering")
                    .with_option("value", "7"),
            )
            .await?;
        harness
            .add(
                EventRule::new("annotate", &["event_list"], "responsemangler", "set", Position::Post)
                    .with_option("JSON pointer", "/detail/note")
                    .with_option("value", "mangled"),
            )
            .await?;

        let addr = serve(api::app(harness.engine.clone(), MAX_BODY)).await?;
        let client = reqwest::Client::new();

        let saved: Value = client
            .post(format!("http://{addr}/v1/events"))
            .json(&json!({
                "name": "audit",
                "events": ["token_init"],
                "handler": "logging",
                "action": "logging",
                "position": "post",
                "ordering": 1
            }))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(saved["result"]["status"], json!(true));
        let id = saved["result"]["value"]["id"].as_i64().ok_or("id missing")?;
        let stored = harness.rules.get(id).await?.ok_or("rule missing")?;
        assert_eq!(stored.ordering, 7);

        let listed: Value = client
            .get(format!("http://{addr}/v1/events"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(listed["detail"]["note"], json!("mangled"));
        assert_eq!(listed["result"]["value"].as_array().map(Vec::len), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_rules_are_rejected_over_http() -> TestResult {
        let harness = Harness::plain()?;
        let addr = serve(api::app(harness.engine.clone(), MAX_BODY)).await?;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/events"))
            .json(&json!({
                "name": "broken",
                "events": ["token_init"],
                "handler": "responsemangler",
                "action": "delete",
                "position": "pre",
                "options": {"JSON pointer": "/detail"}
            }))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await?;
        assert_eq!(body["result"]["status"], json!(false));
        assert!(harness.rules.list().await?.is_empty());
        Ok(())
    }
}
