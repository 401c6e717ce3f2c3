//! Engine behavior tests: dispatch, timeouts, concurrency, request context
//! pairing and snapshot hot-swap.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};

use rasp_js_runtime::{
    Action, ContextSource, Engine, EngineConfig, EngineError, LoadError, MapContext, PluginScript,
    ScriptError, Snapshot, TIMEOUT_MESSAGE, Verdict,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn engine_with(config: EngineConfig, scripts: &[(&str, &str)]) -> Engine {
    init_tracing();
    let engine = Engine::new(config).unwrap();
    engine
        .create_snapshot("", plugins(scripts), "1.0.0")
        .unwrap();
    engine
}

fn engine(scripts: &[(&str, &str)]) -> Engine {
    engine_with(
        EngineConfig {
            pool_size: 4,
            ..Default::default()
        },
        scripts,
    )
}

fn plugins(scripts: &[(&str, &str)]) -> Vec<PluginScript> {
    scripts
        .iter()
        .map(|(name, source)| PluginScript::new(*name, *source))
        .collect()
}

fn context() -> Arc<dyn ContextSource> {
    Arc::new(MapContext::new())
}

fn check(engine: &Engine, checkpoint: &str, params: Value) -> Option<String> {
    check_with(engine, checkpoint, params, context())
}

fn check_with(engine: &Engine, checkpoint: &str, params: Value, context: Arc<dyn ContextSource>) -> Option<String> {
    engine
        .check(checkpoint, params.to_string().as_bytes(), context, 1000)
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

fn capture_logs(engine: &Engine) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    engine.set_logger(Some(Arc::new(move |line: &str| sink.lock().push(line.to_string()))));
    lines
}

const ECHO: &str = r#"
    const plugin = new RASP('test');
    plugin.register('request', (params) => params);
"#;

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_no_handlers_is_no_verdict() {
    let engine = engine(&[("echo.js", ECHO)]);
    assert_eq!(check(&engine, "sql", json!({"query": "select 1"})), None);
}

#[test]
fn test_echoed_verdicts() {
    let engine = engine(&[("echo.js", ECHO)]);

    assert_eq!(
        check(&engine, "request", json!({"action": "log"})).as_deref(),
        Some(r#"[{"action":"log","message":"","name":"test","confidence":0}]"#)
    );
    assert_eq!(check(&engine, "request", json!({"action": "ignore"})), None);
    assert_eq!(check(&engine, "request", json!({"message": "no action"})), None);
}

#[test]
fn test_block_verdict() {
    let engine = engine(&[(
        "test2.js",
        r#"
            const plugin = new RASP('test2');
            plugin.register('request', () => ({ action: 'block' }));
        "#,
    )]);
    assert_eq!(
        check(&engine, "request", json!({})).as_deref(),
        Some(r#"[{"action":"block","message":"","name":"test2","confidence":0}]"#)
    );
}

#[test]
fn test_handlers_run_in_registration_order() {
    let engine = engine(&[
        ("a.js", "new RASP('a').register('sql', () => ({ action: 'log', message: 'first' }));"),
        ("b.js", "new RASP('b').register('sql', () => ({ action: 'block', message: 'second' }));"),
    ]);

    let verdicts = engine.check_verdicts("sql", br#"{}"#, context(), 1000);
    let messages: Vec<_> = verdicts.iter().map(|v| v.message.as_str()).collect();
    assert_eq!(messages, vec!["first", "second"]);
    assert_eq!(verdicts[0].name.as_deref(), Some("a"));
    assert_eq!(verdicts[1].action, Action::Block);
}

#[test]
fn test_throwing_handler_does_not_stop_others() {
    let engine = engine(&[
        ("bad.js", "new RASP('bad').register('sql', () => { throw new Error('kaboom'); });"),
        ("good.js", "new RASP('good').register('sql', () => ({ action: 'block' }));"),
    ]);
    let logs = capture_logs(&engine);

    let verdicts = engine.check_verdicts("sql", b"{}", context(), 1000);
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].name.as_deref(), Some("good"));
    assert!(logs.lock().iter().any(|l| l.starts_with("[bad]") && l.contains("kaboom")));
}

#[test]
fn test_async_handler() {
    let engine = engine(&[(
        "async.js",
        r#"
            const plugin = new RASP('async');
            plugin.register('sql', async (params) => ({ action: 'block', message: params.query }));
            plugin.register('command', () => Promise.reject(new Error('rejected')));
        "#,
    )]);
    let logs = capture_logs(&engine);

    let verdicts = engine.check_verdicts("sql", br#"{"query":"drop"}"#, context(), 1000);
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].message, "drop");

    assert!(engine.check_verdicts("command", b"{}", context(), 1000).is_empty());
    assert!(logs.lock().iter().any(|l| l.contains("rejected")));
}

#[test]
fn test_malformed_action_dropped() {
    let engine = engine(&[(
        "weird.js",
        "new RASP('weird').register('sql', () => ({ action: 'allow' }));",
    )]);
    let logs = capture_logs(&engine);

    assert_eq!(check(&engine, "sql", json!({})), None);
    assert!(logs.lock().iter().any(|l| l.contains("unsupported action 'allow'")));
}

#[test]
fn test_invalid_params_logged() {
    let engine = engine(&[("echo.js", ECHO)]);
    let logs = capture_logs(&engine);

    assert_eq!(engine.check("request", b"{not json", context(), 1000), None);
    assert!(logs.lock().iter().any(|l| l.contains("Failed to parse parameters")));
}

#[test]
fn test_unknown_checkpoint() {
    let engine = engine(&[("echo.js", ECHO)]);
    let logs = capture_logs(&engine);

    assert_eq!(check(&engine, "notACheckpoint", json!({"action": "block"})), None);
    assert!(logs.lock().contains(&"Unknown check point name 'notACheckpoint'".to_string()));
}

#[test]
fn test_console_and_plugin_log_reach_sink() {
    let engine = engine(&[(
        "chatty.js",
        r#"
            const plugin = new RASP('chatty');
            plugin.register('request', (params) => {
                console.log('hello', 42, { a: 1 });
                plugin.log('from plugin');
            });
        "#,
    )]);
    let logs = capture_logs(&engine);

    assert_eq!(check(&engine, "request", json!({})), None);
    let logs = logs.lock();
    assert!(logs.contains(&r#"hello 42 {"a":1}"#.to_string()));
    assert!(logs.contains(&"[chatty] from plugin".to_string()));
}

#[test]
fn test_context_fields() {
    let engine = engine(&[(
        "ctx.js",
        r#"
            const plugin = new RASP('ctx');
            plugin.register('request', (params, context) => ({
                action: 'log',
                message: [
                    context.url,
                    context.header.host,
                    JSON.stringify(context.parameter),
                    String(context.body.byteLength),
                    String(context.method),
                ].join('|'),
            }));
        "#,
    )]);

    let context = MapContext::new()
        .with_string("url", "/login")
        .with_object("header", json!({"host": "example.com"}))
        .with_buffer("body", "user=admin");
    let verdicts = engine.check_verdicts("request", b"{}", Arc::new(context), 1000);
    assert_eq!(verdicts[0].message, "/login|example.com|{}|10|");
}

#[test]
fn test_missing_context_fields_have_empty_defaults() {
    let engine = engine(&[(
        "empty.js",
        r#"
            new RASP('empty').register('request', (params, context) => ({
                action: 'log',
                message: [
                    typeof context.url,
                    context.url.toLowerCase().length,
                    context.body instanceof ArrayBuffer,
                    context.body.byteLength,
                    JSON.stringify(context.header),
                ].join('|'),
            }));
        "#,
    )]);

    let verdicts = engine.check_verdicts("request", b"{}", context(), 1000);
    assert_eq!(verdicts[0].message, "string|0|true|0|{}");
}

#[test]
fn test_large_body_reaches_plugins_whole() {
    let engine = engine(&[(
        "body.js",
        r#"
            new RASP('body').register('request', (params, context) => {
                const bytes = new Uint8Array(context.body);
                return { action: 'log', message: bytes.length + ':' + String.fromCharCode(bytes[bytes.length - 1]) };
            });
        "#,
    )]);

    let mut body = "a".repeat(5 * 1024 * 1024);
    body.push('z');
    let context = MapContext::new().with_buffer("body", body);
    let verdicts = engine.check_verdicts("request", b"{}", Arc::new(context), 5000);
    assert_eq!(verdicts[0].message, format!("{}:z", 5 * 1024 * 1024 + 1));
}

#[test]
fn test_stack_source() {
    let engine = engine(&[(
        "stack.js",
        r#"
            new RASP('stack').register('command', () => ({
                action: 'log',
                message: JSON.stringify(RASP.get_stack()),
            }));
        "#,
    )]);
    engine.set_stack_source(Some(Arc::new(|| {
        Some(vec!["java.lang.Runtime.exec".to_string(), "Main.main".to_string()])
    })));

    let verdicts = engine.check_verdicts("command", b"{}", context(), 1000);
    assert_eq!(verdicts[0].message, r#"["java.lang.Runtime.exec","Main.main"]"#);
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts and faults
// ─────────────────────────────────────────────────────────────────────────────

const SPIN: &str = r#"
    const plugin = new RASP('spin');
    plugin.register('request', () => { for (;;) {} });
    plugin.register('sql', () => ({ action: 'log', message: 'fine' }));
"#;

#[test]
fn test_runaway_handler_times_out() {
    let engine = engine(&[("spin.js", SPIN)]);

    let started = Instant::now();
    let result = engine.check("request", b"{}", context(), 100);
    let elapsed = started.elapsed();

    assert_eq!(
        String::from_utf8(result.unwrap()).unwrap(),
        format!(r#"[{{"action":"exception","message":"{}"}}]"#, TIMEOUT_MESSAGE)
    );
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);

    // Isolates survive an interrupt.
    let verdicts = engine.check_verdicts("sql", b"{}", context(), 100);
    assert_eq!(verdicts[0].message, "fine");
}

#[test]
fn test_runaway_async_handler_times_out() {
    let engine = engine(&[(
        "async-spin.js",
        r#"
            const plugin = new RASP('async-spin');
            plugin.register('request', () => ({ action: 'block', message: 'sibling' }));
            plugin.register('request', async () => { await null; for (;;) {} });
        "#,
    )]);

    let started = Instant::now();
    let verdicts = engine.check_verdicts("request", b"{}", context(), 100);
    assert_eq!(verdicts, vec![Verdict::timeout(Action::Exception)]);
    assert!(started.elapsed() < Duration::from_millis(1000), "took {:?}", started.elapsed());
}

#[test]
fn test_timed_out_dispatch_keeps_no_context_state() {
    let engine = engine(&[(
        "slow-pair.js",
        r#"
            const plugin = new RASP('slow-pair');
            plugin.register('request', async (params, context) => {
                context.tag = 'late';
                await null;
                for (;;) {}
            });
        "#,
    )]);

    let context: Arc<dyn ContextSource> = Arc::new(MapContext::new().with_request_id("r-timeout"));
    let verdicts = engine.check_verdicts("request", b"{}", context, 50);
    assert_eq!(verdicts, vec![Verdict::timeout(Action::Exception)]);
    assert_eq!(engine.cached_contexts(), 0);
}

#[test]
fn test_thrown_out_of_memory_error_keeps_isolate() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            ..Default::default()
        },
        &[(
            "liar.js",
            r#"
                const plugin = new RASP('liar');
                plugin.register('request', () => { throw new InternalError('out of memory'); });
            "#,
        )],
    );
    let logs = capture_logs(&engine);

    assert!(engine.check_verdicts("request", b"{}", context(), 1000).is_empty());
    assert!(logs.lock().iter().any(|line| line.starts_with("[liar] InternalError: out of memory")));
    assert_eq!(engine.status().live, 1);
}

#[test]
fn test_timeout_action_log() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            timeout_action: Action::Log,
            ..Default::default()
        },
        &[("spin.js", SPIN)],
    );
    let verdicts = engine.check_verdicts("request", b"{}", context(), 50);
    assert_eq!(verdicts, vec![Verdict::timeout(Action::Log)]);
}

#[test]
fn test_repeated_timeouts_leave_pool_healthy() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 2,
            ..Default::default()
        },
        &[("spin.js", SPIN)],
    );
    for _ in 0..5 {
        let verdicts = engine.check_verdicts("request", b"{}", context(), 20);
        assert_eq!(verdicts, vec![Verdict::timeout(Action::Exception)]);
    }
    assert_eq!(engine.check_verdicts("sql", b"{}", context(), 0)[0].message, "fine");
    assert!(engine.status().live <= 2);
}

#[test]
fn test_out_of_memory_discards_isolate() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            memory_limit: 16 * 1024 * 1024,
            ..Default::default()
        },
        &[(
            "hog.js",
            r#"
                const plugin = new RASP('hog');
                plugin.register('request', () => { let s = 'x'; for (;;) { s += s; } });
                plugin.register('sql', () => ({ action: 'log', message: 'fine' }));
            "#,
        )],
    );

    let verdicts = engine.check_verdicts("request", b"{}", context(), 5000);
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].action, Action::Exception);
    assert_eq!(verdicts[0].message, rasp_js_runtime::OUT_OF_MEMORY_MESSAGE);

    assert_eq!(engine.check_verdicts("sql", b"{}", context(), 1000)[0].message, "fine");
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_checks_do_not_cross_talk() {
    let config = EngineConfig {
        pool_size: 4,
        acquire_timeout_ms: 30_000,
        ..Default::default()
    };
    let engine = Arc::new(engine_with(config, &[(
        "id.js",
        r#"
            new RASP('id').register('sql', (params) => {
                let spin = 0;
                for (let i = 0; i < 1000; i++) { spin += i; }
                return { action: 'log', message: String(params.id) };
            });
        "#,
    )]));

    let workers: Vec<_> = (0..128)
        .map(|worker| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..4 {
                    let id = worker * 100 + i;
                    let verdicts = engine.check_verdicts(
                        "sql",
                        json!({ "id": id }).to_string().as_bytes(),
                        context(),
                        5000,
                    );
                    assert_eq!(verdicts.len(), 1);
                    assert_eq!(verdicts[0].message, id.to_string());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(engine.status().live <= 4);
}

const PAIRING: &str = r#"
    const plugin = new RASP('pair');
    plugin.register('request', (params, context) => {
        context.tag = params.tag;
    });
    plugin.register('requestEnd', (params, context) => ({
        action: 'log',
        message: String(context.tag),
    }));
"#;

#[test]
fn test_context_pairing_across_requests() {
    let engine = Arc::new(engine(&[("pair.js", PAIRING)]));

    let requests: Vec<_> = (0..32)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                let request_id = uuid::Uuid::new_v4().to_string();
                let tag = uuid::Uuid::new_v4().to_string();
                let context: Arc<dyn ContextSource> =
                    Arc::new(MapContext::new().with_request_id(request_id.clone()));

                let begin = engine.check_verdicts(
                    "request",
                    json!({ "tag": tag }).to_string().as_bytes(),
                    context.clone(),
                    5000,
                );
                assert!(begin.is_empty());

                let delay = rand::thread_rng().gen_range(0..20);
                thread::sleep(Duration::from_millis(delay));

                let end = engine.check_verdicts("requestEnd", b"{}", context, 5000);
                assert_eq!(end.len(), 1);
                assert_eq!(end[0].message, tag);
            })
        })
        .collect();

    for request in requests {
        request.join().unwrap();
    }
    assert_eq!(engine.cached_contexts(), 0);
}

#[test]
fn test_context_not_shared_without_request_id() {
    let engine = engine(&[("pair.js", PAIRING)]);
    engine.check_verdicts("request", br#"{"tag":"a"}"#, context(), 1000);
    let end = engine.check_verdicts("requestEnd", b"{}", context(), 1000);
    assert_eq!(end[0].message, "undefined");
}

#[test]
fn test_stale_request_context_swept() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            context_ttl_secs: 0,
            ..Default::default()
        },
        &[("pair.js", PAIRING)],
    );
    let context: Arc<dyn ContextSource> = Arc::new(MapContext::new().with_request_id("abandoned"));
    engine.check_verdicts("request", br#"{"tag":"a"}"#, context, 1000);
    assert_eq!(engine.cached_contexts(), 1);

    assert_eq!(engine.sweep_contexts(), 1);
    assert_eq!(engine.cached_contexts(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────────────────────────

fn versioned(version: &str) -> String {
    format!(
        "new RASP('v').register('sql', () => ({{ action: 'log', message: '{}' }}));",
        version
    )
}

#[test]
fn test_no_snapshot_is_no_verdict() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    assert_eq!(check(&engine, "request", json!({"action": "block"})), None);
}

#[test]
fn test_create_snapshot_is_idempotent() {
    let engine = engine(&[("echo.js", ECHO)]);
    let first = check(&engine, "request", json!({"action": "block"}));

    engine
        .create_snapshot("", plugins(&[("echo.js", ECHO)]), "1.0.0")
        .unwrap();
    let second = check(&engine, "request", json!({"action": "block"}));

    assert_eq!(first, second);
    assert_eq!(engine.status().generation, 2);
}

#[test]
fn test_hot_swap() {
    let v1 = versioned("v1");
    let engine = engine(&[("v.js", v1.as_str())]);
    assert_eq!(engine.check_verdicts("sql", b"{}", context(), 1000)[0].message, "v1");

    let v2 = versioned("v2");
    engine
        .create_snapshot("", plugins(&[("v.js", v2.as_str())]), "2.0.0")
        .unwrap();
    for _ in 0..8 {
        assert_eq!(engine.check_verdicts("sql", b"{}", context(), 1000)[0].message, "v2");
    }
    assert_eq!(engine.status().snapshot_version.as_deref(), Some("2.0.0"));
}

#[test]
fn test_failed_build_keeps_active_snapshot() {
    let v1 = versioned("v1");
    let engine = engine(&[("v.js", v1.as_str())]);
    let logs = capture_logs(&engine);

    let err = engine
        .create_snapshot(
            "",
            plugins(&[("ok.js", "1"), ("broken.js", "this is not javascript")]),
            "2.0.0",
        )
        .unwrap_err();
    match err {
        EngineError::Load(LoadError::Script { name, .. }) => assert_eq!(name, "broken.js"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(logs.lock().iter().any(|l| l.contains("broken.js")));

    assert_eq!(engine.snapshot().unwrap().version(), "1.0.0");
    assert_eq!(engine.check_verdicts("sql", b"{}", context(), 1000)[0].message, "v1");
}

#[test]
fn test_config_and_version_visible_to_plugins() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .create_snapshot(
            r#"{"block_sql": true}"#,
            plugins(&[(
                "cfg.js",
                r#"
                    new RASP('cfg').register('sql', () => ({
                        action: config.block_sql ? 'block' : 'log',
                        message: RASP.get_version(),
                    }));
                "#,
            )]),
            "3.1.4",
        )
        .unwrap();

    let verdicts = engine.check_verdicts("sql", b"{}", context(), 1000);
    assert_eq!(verdicts[0].action, Action::Block);
    assert_eq!(verdicts[0].message, "3.1.4");
}

#[test]
fn test_install_saved_snapshot() {
    let engine = engine(&[("echo.js", ECHO)]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    engine.snapshot().unwrap().save(&path).unwrap();

    init_tracing();
    let restored = Engine::new(EngineConfig::default()).unwrap();
    let snapshot = restored.install_snapshot(Snapshot::load(&path).unwrap()).unwrap();
    assert_eq!(snapshot.version(), "1.0.0");
    assert_eq!(snapshot.generation(), 1);
    assert_eq!(
        check(&restored, "request", json!({"action": "block"})).as_deref(),
        Some(r#"[{"action":"block","message":"","name":"test","confidence":0}]"#)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripts and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_execute_script() {
    let engine = engine(&[("echo.js", ECHO)]);

    assert_eq!(engine.execute_script("1 + 1", "sum.js").unwrap(), "2");
    assert_eq!(engine.execute_script("'text'", "text.js").unwrap(), "text");
    assert_eq!(
        engine.execute_script("Object.keys(RASP.plugins).join(',')", "plugins.js").unwrap(),
        "test"
    );

    match engine.execute_script("throw new Error('bad script')", "bad.js") {
        Err(ScriptError::Exception(message)) => {
            assert!(message.starts_with("bad.js:"));
            assert!(message.contains("bad script"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_execute_script_timeout() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            script_timeout_ms: 50,
            ..Default::default()
        },
        &[("echo.js", ECHO)],
    );
    assert!(matches!(
        engine.execute_script("while (true) {}", "loop.js"),
        Err(ScriptError::Timeout(50))
    ));
}

#[test]
fn test_initialize_resizes() {
    let engine = engine(&[("echo.js", ECHO)]);
    engine.initialize(4).unwrap();
    assert_eq!(engine.status().capacity, 4);

    engine.initialize(2).unwrap();
    let status = engine.status();
    assert_eq!(status.capacity, 2);
    assert_eq!(status.generation, 1);
    assert!(check(&engine, "request", json!({"action": "log"})).is_some());

    assert!(matches!(engine.initialize(0), Err(EngineError::InvalidPoolSize)));
}

#[test]
fn test_dispose() {
    let engine = engine(&[("echo.js", ECHO)]);
    assert!(check(&engine, "request", json!({"action": "log"})).is_some());

    engine.dispose();
    assert_eq!(check(&engine, "request", json!({"action": "log"})), None);
    assert_eq!(engine.status().live, 0);
    assert!(engine.snapshot().is_none());

    engine.initialize(1).unwrap();
    engine
        .create_snapshot("", plugins(&[("echo.js", ECHO)]), "1.0.1")
        .unwrap();
    assert!(check(&engine, "request", json!({"action": "log"})).is_some());
}
