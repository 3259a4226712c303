//! End-to-end tests driving real plugin processes.
//!
//! Every plugin here is a copy of the `kennel-echo-plugin` binary installed
//! under a temporary plugins directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kennel_plugins::prelude::*;
use kennel_plugins::rpc::protocol::PLUGIN_ID_KEY;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(20);

fn echo_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kennel-echo-plugin"))
}

fn install(dir: &Path, id: &str) {
    let target = dir.join(id).join(id);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::copy(echo_binary(), &target).unwrap();
}

fn plugins_dir(ids: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for id in ids {
        install(dir.path(), id);
    }
    dir
}

fn config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig::new(dir.path())
        .with_connect_timeout(Duration::from_secs(10))
        .with_call_timeout(Duration::from_secs(10))
        .with_sandbox_timeout(Duration::from_secs(10))
        .with_idle_timeout(Duration::ZERO)
}

fn new_manager(config: ManagerConfig) -> PluginManager {
    PluginManager::new(config).unwrap()
}

fn id(s: &'static str) -> PluginId {
    PluginId::from_static(s)
}

fn descriptor(plugin: &'static str) -> PluginDescriptor {
    PluginDescriptor::new(id(plugin), "1.0.0")
}

fn ext_descriptor() -> PluginDescriptor {
    descriptor("ext").with_dependency(PluginDependency::required(id("core"), "^1.0.0"))
}

async fn wait_for_state(manager: &PluginManager, plugin: &PluginId, state: LifecycleState) {
    tokio::time::timeout(WAIT, async {
        loop {
            if manager.get_plugin(plugin).await.map(|p| p.state()) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{plugin} never reached {state}"));
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<PluginEvent>, mut wanted: F) -> PluginEvent
where
    F: FnMut(&PluginEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event not observed")
}

async fn host_side_fault(_module: Arc<dyn PluginModule>) -> PluginResult<Value> {
    panic!("host-side fault");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_core_ext_scenario() {
    let dir = plugins_dir(&["core", "ext"]);
    let manager = new_manager(config(&dir));

    let core = descriptor("core").auto_start();
    let ext = ext_descriptor().auto_start();
    manager.register_descriptor(&core).await.unwrap();
    manager.register_descriptor(&ext).await.unwrap();
    assert_eq!(manager.dependency_order().await.unwrap(), vec![id("core"), id("ext")]);

    manager.load_plugin(core).await.unwrap();
    manager.load_plugin(ext).await.unwrap();
    wait_for_state(&manager, &id("core"), LifecycleState::Running).await;
    wait_for_state(&manager, &id("ext"), LifecycleState::Running).await;

    manager.stop().await.unwrap();
    for plugin in ["core", "ext"] {
        let status = manager.get_plugin_status(&id(plugin)).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped, "{plugin}");
        assert_eq!(status.health, PluginHealth::Inactive);
    }

    // A stopped manager takes no new work.
    assert!(matches!(
        manager.load_plugin(descriptor("late")).await,
        Err(PluginError::Cancelled)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependent_blocks_stop_and_unload() {
    let dir = plugins_dir(&["core", "ext"]);
    let manager = new_manager(config(&dir));

    manager.load_plugin(descriptor("core")).await.unwrap();
    manager.load_plugin(ext_descriptor()).await.unwrap();

    // Starting ext brings its dependency up first.
    manager.start_plugin(&id("ext")).await.unwrap();
    assert_eq!(
        manager.get_plugin(&id("core")).await.unwrap().state(),
        LifecycleState::Running
    );

    match manager.stop_plugin(&id("core")).await {
        Err(PluginError::HasDependents { dependents, .. }) => assert_eq!(dependents, vec![id("ext")]),
        other => panic!("expected HasDependents, got {other:?}"),
    }
    assert!(matches!(
        manager.unload_plugin(&id("core")).await,
        Err(PluginError::HasDependents { .. })
    ));

    manager.unload_plugin(&id("ext")).await.unwrap();
    manager.unload_plugin(&id("core")).await.unwrap();
    assert!(manager.list_plugins().await.is_empty());
    assert!(matches!(
        manager.check_dependencies(&id("core")).await,
        Err(PluginError::NotRegistered(_))
    ));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execute_and_status() {
    let dir = plugins_dir(&["echo"]);
    let manager = new_manager(config(&dir));
    let echo = id("echo");

    manager
        .load_plugin(descriptor("echo").with_config("greeting", json!("hi")))
        .await
        .unwrap();
    assert!(matches!(
        manager.execute(&echo, "echo", Value::Null).await,
        Err(PluginError::NotRunning(_))
    ));
    manager.start_plugin(&echo).await.unwrap();
    assert!(matches!(
        manager.start_plugin(&echo).await,
        Err(PluginError::AlreadyRunning(_))
    ));

    let params = json!({"items": [1, 2, 3]});
    assert_eq!(manager.execute(&echo, "echo", params.clone()).await.unwrap(), params);
    assert_eq!(
        manager.execute(&echo, "whoami", Value::Null).await.unwrap()["plugin_id"],
        "echo"
    );
    assert_eq!(
        manager.execute(&echo, "config", Value::Null).await.unwrap(),
        json!({"greeting": "hi"})
    );

    let reply = manager
        .send_message(&echo, PluginMessage::new("audit", "m-7", json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(reply["received"], "audit");
    assert_eq!(reply["id"], "m-7");

    match manager.execute(&echo, "fail", Value::Null).await {
        Err(PluginError::Remote(message)) => assert_eq!(message, "requested failure"),
        other => panic!("expected remote failure, got {other:?}"),
    }
    // A panic inside the plugin process comes back as an error response.
    match manager.execute(&echo, "panic", Value::Null).await {
        Err(PluginError::Remote(message)) => assert!(message.contains("requested panic")),
        other => panic!("expected remote failure, got {other:?}"),
    }

    let status = manager.get_plugin_status(&echo).await.unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.health, PluginHealth::Healthy);
    assert_eq!(status.stats.total_calls, 6);
    assert_eq!(status.stats.failed_calls, 2);
    assert!(status.pid.is_some());
    assert_eq!(status.info.unwrap().name, "kennel-echo-plugin");

    assert_eq!(manager.list_plugins().await, vec![echo.clone()]);
    assert!(matches!(
        manager.get_plugin_status(&id("ghost")).await,
        Err(PluginError::NotFound(_))
    ));
    assert!(matches!(
        manager.execute(&id("ghost"), "echo", Value::Null).await,
        Err(PluginError::NotFound(_))
    ));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_deadline_and_host_fault() {
    let dir = plugins_dir(&["slow"]);
    let manager = new_manager(
        config(&dir).with_sandbox_timeout(Duration::from_millis(300)),
    );
    let slow = id("slow");
    manager.load_plugin(descriptor("slow")).await.unwrap();
    manager.start_plugin(&slow).await.unwrap();

    let err = manager
        .execute(&slow, "sleep", json!({"ms": 3000}))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Timeout(_)), "{err:?}");
    assert_eq!(manager.get_plugin_status(&slow).await.unwrap().stats.timeouts, 1);

    // The channel survives an abandoned call.
    assert_eq!(
        manager.execute(&slow, "echo", json!("again")).await.unwrap(),
        json!("again")
    );

    let err = manager
        .execute_plugin_func(&slow, host_side_fault)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Critical { .. }), "{err:?}");
    let status = manager.get_plugin_status(&slow).await.unwrap();
    assert_eq!(status.stats.panics, 1);
    assert_eq!(status.health, PluginHealth::Unhealthy);
    assert!(status.last_error.unwrap().contains("host-side fault"));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_caller_cancellation() {
    let dir = plugins_dir(&["slow"]);
    let manager = new_manager(config(&dir));
    let slow = id("slow");
    manager.load_plugin(descriptor("slow")).await.unwrap();
    manager.start_plugin(&slow).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = manager
        .execute_plugin_func_with_context(&slow, &cancel, |module, _token| async move {
            module.execute("sleep", json!({"ms": 3000})).await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Cancelled), "{err:?}");

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_restart_reuses_process() {
    let dir = plugins_dir(&["echo"]);
    let manager = new_manager(config(&dir));
    let echo = id("echo");
    manager.load_plugin(descriptor("echo")).await.unwrap();
    manager.start_plugin(&echo).await.unwrap();

    let before = manager.execute(&echo, "whoami", Value::Null).await.unwrap();
    assert_eq!(before["inits"], 1);

    let mut events = manager.subscribe();
    manager.restart_plugin(&echo).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, PluginEvent::Restarted { .. })).await;

    let after = manager.execute(&echo, "whoami", Value::Null).await.unwrap();
    assert_eq!(after["pid"], before["pid"]);
    assert_eq!(after["inits"], 2);
    assert_eq!(manager.get_plugin_status(&echo).await.unwrap().restart_count, 1);

    manager.stop_plugin(&echo).await.unwrap();
    assert!(matches!(
        manager.stop_plugin(&echo).await,
        Err(PluginError::NotRunning(_))
    ));
    assert!(matches!(
        manager.restart_plugin(&echo).await,
        Err(PluginError::NotRunning(_))
    ));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_check_restarts_crashed_plugin() {
    let dir = plugins_dir(&["fragile"]);
    let manager = new_manager(
        config(&dir).with_health_check_interval(Duration::from_millis(100)),
    );
    let fragile = id("fragile");
    manager
        .load_plugin(descriptor("fragile").auto_restart())
        .await
        .unwrap();
    manager.start_plugin(&fragile).await.unwrap();
    let first_pid = manager.get_plugin_status(&fragile).await.unwrap().pid;

    let mut events = manager.subscribe();
    manager.start_health_check();

    let err = manager
        .execute(&fragile, "exit", json!({"code": 7}))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::ConnectionFailure(_)), "{err:?}");

    wait_for_event(&mut events, |e| matches!(e, PluginEvent::Restarted { .. })).await;
    let status = manager.get_plugin_status(&fragile).await.unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.restart_count, 1);
    assert_ne!(status.pid, first_pid);
    assert_eq!(status.stats.total_calls, 0);

    assert_eq!(
        manager.execute(&fragile, "echo", json!(1)).await.unwrap(),
        json!(1)
    );
    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_plugin_paused_then_resumed() {
    let dir = plugins_dir(&["sleepy"]);
    let manager = new_manager(
        config(&dir)
            .with_health_check_interval(Duration::from_millis(100))
            .with_idle_timeout(Duration::from_millis(200)),
    );
    let sleepy = id("sleepy");
    manager.load_plugin(descriptor("sleepy")).await.unwrap();
    manager.start_plugin(&sleepy).await.unwrap();

    let mut events = manager.subscribe();
    manager.start_health_check();
    wait_for_event(&mut events, |e| matches!(e, PluginEvent::Paused { .. })).await;

    let status = manager.get_plugin_status(&sleepy).await.unwrap();
    assert!(status.paused);
    assert_eq!(status.health, PluginHealth::Paused);
    assert_eq!(status.state, LifecycleState::Running);

    assert_eq!(
        manager.execute(&sleepy, "echo", json!("wake")).await.unwrap(),
        json!("wake")
    );
    wait_for_event(&mut events, |e| matches!(e, PluginEvent::Resumed { .. })).await;

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_all_and_stop_all_follow_dependency_order() {
    let dir = plugins_dir(&["core", "ext", "audit"]);
    let config = config(&dir)
        .with_plugin(ext_descriptor())
        .with_plugin(descriptor("core"))
        .with_plugin(descriptor("audit").disabled());
    let manager = new_manager(config);
    let mut events = manager.subscribe();

    manager.start_all().await.unwrap();
    assert_eq!(manager.list_plugins().await, vec![id("core"), id("ext")]);

    let mut started = Vec::new();
    while started.len() < 2 {
        if let PluginEvent::Started { id } =
            wait_for_event(&mut events, |e| matches!(e, PluginEvent::Started { .. })).await
        {
            started.push(id);
        }
    }
    assert_eq!(started, vec![id("core"), id("ext")]);

    manager.stop_all().await.unwrap();
    let mut stopped = Vec::new();
    while stopped.len() < 2 {
        if let PluginEvent::Stopped { id } =
            wait_for_event(&mut events, |e| matches!(e, PluginEvent::Stopped { .. })).await
        {
            stopped.push(id);
        }
    }
    assert_eq!(stopped, vec![id("ext"), id("core")]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_all_rejects_missing_dependency_without_side_effects() {
    let dir = plugins_dir(&["ext"]);
    let manager = new_manager(config(&dir).with_plugin(ext_descriptor()));

    match manager.start_all().await {
        Err(PluginError::DependencyUnsatisfied { id: plugin, missing }) => {
            assert_eq!(plugin, id("ext"));
            assert_eq!(missing, vec!["core".to_string()]);
        },
        other => panic!("expected DependencyUnsatisfied, got {other:?}"),
    }
    assert!(manager.list_plugins().await.is_empty());
    assert!(manager.dependency_order().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_preconditions() {
    let dir = plugins_dir(&["core", "ext"]);
    let manager = new_manager(config(&dir));

    // Missing executable.
    match manager.load_plugin(descriptor("ghost")).await {
        Err(PluginError::ExecutableNotFound { searched, .. }) => assert!(!searched.is_empty()),
        other => panic!("expected ExecutableNotFound, got {other:?}"),
    }

    // Unsatisfied dependency rolls the registration back.
    assert!(matches!(
        manager.load_plugin(ext_descriptor()).await,
        Err(PluginError::DependencyUnsatisfied { .. })
    ));
    assert!(manager.dependency_order().await.unwrap().is_empty());

    // Version gate.
    manager
        .load_plugin(PluginDescriptor::new(id("core"), "2.0.0"))
        .await
        .unwrap();
    match manager.load_plugin(ext_descriptor()).await {
        Err(PluginError::DependencyUnsatisfied { missing, .. }) => {
            assert_eq!(missing, vec!["core@^1.0.0".to_string()]);
        },
        other => panic!("expected DependencyUnsatisfied, got {other:?}"),
    }

    assert!(matches!(
        manager.load_plugin(descriptor("core")).await,
        Err(PluginError::AlreadyLoaded(_))
    ));
    assert!(matches!(
        manager.load_plugin(descriptor("ext").disabled()).await,
        Err(PluginError::Disabled(_))
    ));
    assert!(matches!(
        manager.start_plugin(&id("ghost")).await,
        Err(PluginError::NotLoaded(_))
    ));
    assert!(matches!(
        manager.unload_plugin(&id("ghost")).await,
        Err(PluginError::NotLoaded(_))
    ));

    let loaded = manager.get_plugin(&id("core")).await.unwrap();
    assert_eq!(loaded.state(), LifecycleState::Loaded);
    assert_eq!(loaded.executable(), dir.path().join("core").join("core"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_init_failure_leaves_plugin_failed() {
    let dir = plugins_dir(&["picky"]);
    let manager = new_manager(config(&dir));
    let picky = id("picky");
    manager
        .load_plugin(descriptor("picky").with_config("fail_init", json!(true)))
        .await
        .unwrap();
    let mut events = manager.subscribe();

    match manager.start_plugin(&picky).await {
        Err(PluginError::Remote(message)) => assert!(message.contains("init refused")),
        other => panic!("expected init failure, got {other:?}"),
    }
    let status = manager.get_plugin_status(&picky).await.unwrap();
    assert_eq!(status.state, LifecycleState::Failed);
    assert_eq!(status.health, PluginHealth::Unhealthy);
    assert!(status.pid.is_none());
    assert!(status.last_error.is_some());
    wait_for_event(&mut events, |e| matches!(e, PluginEvent::Failed { .. })).await;

    // A failed plugin can still be unloaded.
    manager.unload_plugin(&picky).await.unwrap();
    manager.stop().await.unwrap();
}

#[cfg(unix)]
fn install_script(dir: &Path, id: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join(id).join(id);
    std::fs::create_dir_all(script.parent().unwrap()).unwrap();
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_handshake_refused() {
    let dir = tempfile::tempdir().unwrap();
    install_script(dir.path(), "stale", "echo '9|kennel|stdio'\nsleep 5");

    let manager = new_manager(config(&dir));
    let stale = id("stale");
    manager.load_plugin(descriptor("stale")).await.unwrap();

    let err = manager.start_plugin(&stale).await.unwrap_err();
    assert!(matches!(err, PluginError::HandshakeFailed(_)), "{err:?}");
    assert_eq!(
        manager.get_plugin(&stale).await.unwrap().state(),
        LifecycleState::Failed
    );
    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_refuses_to_run_directly() {
    let output = tokio::process::Command::new(echo_binary())
        .env_remove("KENNEL_PLUGIN_MAGIC_COOKIE")
        .env(PLUGIN_ID_KEY, "echo")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not meant to be run directly"));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_abandons_pending_auto_start() {
    let dir = tempfile::tempdir().unwrap();
    install_script(dir.path(), "mute", "sleep 30");
    let connect_timeout = Duration::from_secs(60);
    let manager = new_manager(config(&dir).with_connect_timeout(connect_timeout));
    let mute = id("mute");

    manager
        .load_plugin(descriptor("mute").auto_start())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(10), manager.stop())
        .await
        .expect("stop waited on the handshake")
        .unwrap();
    assert!(started.elapsed() < connect_timeout);

    let status = manager.get_plugin_status(&mute).await.unwrap();
    assert_eq!(status.state, LifecycleState::Failed);
    assert!(status.pid.is_none());
    assert!(status.last_error.unwrap().contains("cancelled"));
}

fn audit_descriptor() -> PluginDescriptor {
    descriptor("audit").with_dependency(PluginDependency::optional(id("core"), "^1.0.0"))
}

async fn start_core_and_audit(policy: DependentPolicy) -> (TempDir, PluginManager) {
    let dir = plugins_dir(&["core", "audit"]);
    let manager = new_manager(config(&dir).with_optional_dependents(policy));
    manager.load_plugin(descriptor("core")).await.unwrap();
    manager.load_plugin(audit_descriptor()).await.unwrap();
    manager.start_plugin(&id("core")).await.unwrap();
    manager.start_plugin(&id("audit")).await.unwrap();
    (dir, manager)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_policy_protects_optional_dependency() {
    let (_dir, manager) = start_core_and_audit(DependentPolicy::Block).await;

    for result in [
        manager.stop_plugin(&id("core")).await,
        manager.unload_plugin(&id("core")).await,
    ] {
        match result {
            Err(PluginError::HasDependents { id: plugin, dependents }) => {
                assert_eq!(plugin, id("core"));
                assert_eq!(dependents, vec![id("audit")]);
            },
            other => panic!("expected HasDependents, got {other:?}"),
        }
    }
    assert_eq!(
        manager.get_plugin(&id("core")).await.unwrap().state(),
        LifecycleState::Running
    );

    // Once the dependent is stopped the running-dependents check passes,
    // but unload still sees the registered dependent.
    manager.stop_plugin(&id("audit")).await.unwrap();
    manager.stop_plugin(&id("core")).await.unwrap();
    assert!(matches!(
        manager.unload_plugin(&id("core")).await,
        Err(PluginError::HasDependents { .. })
    ));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_warn_policy_lets_optional_dependency_go() {
    let (_dir, manager) = start_core_and_audit(DependentPolicy::Warn).await;

    manager.stop_plugin(&id("core")).await.unwrap();
    manager.unload_plugin(&id("core")).await.unwrap();

    assert_eq!(manager.list_plugins().await, vec![id("audit")]);
    assert_eq!(
        manager.execute(&id("audit"), "echo", json!("still here")).await.unwrap(),
        json!("still here")
    );
    manager.stop().await.unwrap();
}
