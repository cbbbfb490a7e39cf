mod common;

use canopy_package::{ArchiveBuilder, Capability, PluginManifest};
use canopy_plugin_host::*;
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn storage_plugin() -> String {
    WatPlugin::new()
        .on_invoke(|l| l.call_drop("storage.set", r#"["invoked",true]"#))
        .build()
}

// ── End-to-end scenarios ───────────────────────────────────────

#[tokio::test]
async fn enabled_plugin_with_storage_round_trips() {
    let host = test_host();
    host.install(manifest("p1", &[Capability::StorageLocal]), &noop_plugin(), true);
    host.orchestrator.sync().await;
    assert_eq!(host.orchestrator.running_ids(), vec!["p1".to_string()]);

    host.orchestrator
        .host_call("p1", "storage.set", json!(["k", "v"]))
        .await
        .unwrap();
    let value = host
        .orchestrator
        .host_call("p1", "storage.get", json!(["k"]))
        .await
        .unwrap();
    assert_eq!(value, json!("v"));
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn plugin_without_storage_is_denied() {
    let host = test_host();
    host.install(manifest("p2", &[]), &noop_plugin(), true);
    host.orchestrator.sync().await;

    let err = host
        .orchestrator
        .host_call("p2", "storage.set", json!(["k", "v"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginHostError::PermissionDenied { capability: Capability::StorageLocal, .. }));
    assert_eq!(host.stored("p2", "k"), None);
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn disabling_tears_down_instance_and_commands() {
    let host = test_host();
    host.install(
        with_command(manifest("p1", &[Capability::StorageLocal]), "p1.run"),
        &storage_plugin(),
        true,
    );
    host.orchestrator.sync().await;
    assert!(host.orchestrator.execute_command("p1.run"));
    assert_eq!(host.wait_for_key("p1", "invoked").await, Some(json!(true)));
    let runtime = host.orchestrator.runtime("p1").unwrap();

    host.registry.set_enabled("p1", false).unwrap();
    host.orchestrator.sync().await;
    assert!(host.orchestrator.running_ids().is_empty());
    assert_eq!(runtime.state(), SandboxState::Stopped);
    assert!(!host.orchestrator.execute_command("p1.run"));
    assert!(host.commands.ids().is_empty());
}

#[tokio::test]
async fn disabled_plugin_cannot_make_host_calls() {
    let host = test_host();
    host.install(manifest("p1", &[Capability::StorageLocal]), &noop_plugin(), true);
    host.orchestrator.sync().await;
    host.orchestrator
        .host_call("p1", "storage.set", json!(["k", "before"]))
        .await
        .unwrap();

    host.registry.set_enabled("p1", false).unwrap();
    host.orchestrator.sync().await;
    let err = host
        .orchestrator
        .host_call("p1", "storage.set", json!(["k", "after"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginHostError::PluginNotFound(_)));
    assert_eq!(host.stored("p1", "k"), Some(json!("before")));
}

#[tokio::test]
async fn archive_with_missing_entry_is_rejected() {
    let host = test_host();
    host.install(manifest("existing", &[]), &noop_plugin(), false);
    let before = host.registry.get_all().len();

    let bytes = ArchiveBuilder::new()
        .manifest("plugin", &PluginManifest::new("p4", "P4", "1.0.0", "dist/main.wat"))
        .unwrap()
        .build()
        .unwrap();
    let err = PackageInstaller::new(Arc::clone(&host.registry))
        .install_archive(&bytes)
        .unwrap_err();

    assert!(matches!(err, PluginHostError::ManifestInvalid(_)));
    assert_eq!(host.registry.get_all().len(), before);
}

// ── Reconciliation ─────────────────────────────────────────────

#[tokio::test]
async fn sync_is_idempotent() {
    let host = test_host();
    host.install(manifest("a", &[]), &noop_plugin(), true);
    host.install(manifest("b", &[]), &noop_plugin(), false);
    host.install(manifest("c", &[]), &noop_plugin(), true);

    host.orchestrator.sync().await;
    let first = host.orchestrator.running_ids();
    let runtime_a = host.orchestrator.runtime("a").unwrap();

    host.orchestrator.sync().await;
    assert_eq!(host.orchestrator.running_ids(), first);
    assert_eq!(first, vec!["a".to_string(), "c".to_string()]);
    // The same instance survives a no-op pass.
    assert!(Arc::ptr_eq(&runtime_a, &host.orchestrator.runtime("a").unwrap()));
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_syncs_converge_to_one_instance() {
    let host = test_host();
    let entry = WatPlugin::new()
        .on_activate(|l| l.call_drop("ui.showToast", r#"["activated"]"#))
        .build();
    host.install(manifest("a", &[]), &entry, true);

    let (first, second) = (host.orchestrator.clone(), host.orchestrator.clone());
    tokio::join!(first.sync(), second.sync());

    assert_eq!(host.orchestrator.running_ids(), vec!["a".to_string()]);
    assert_eq!(host.notifier.messages(), vec!["activated".to_string()]);
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn uninstall_stops_the_instance() {
    let host = test_host();
    host.install(manifest("a", &[]), &noop_plugin(), true);
    host.orchestrator.sync().await;

    host.registry.uninstall("a").unwrap();
    host.orchestrator.sync().await;
    assert!(host.orchestrator.running_ids().is_empty());
}

#[tokio::test]
async fn update_reloads_the_instance() {
    let host = test_host();
    let v1 = WatPlugin::new()
        .on_activate(|l| l.call_drop("ui.showToast", r#"["v1"]"#))
        .build();
    let v2 = WatPlugin::new()
        .on_activate(|l| l.call_drop("ui.showToast", r#"["v2"]"#))
        .build();

    host.install(manifest("a", &[]), &v1, true);
    host.orchestrator.sync().await;
    let old = host.orchestrator.runtime("a").unwrap();

    host.install(manifest("a", &[]), &v2, true);
    host.orchestrator.sync().await;
    assert_eq!(old.state(), SandboxState::Stopped);
    assert!(host.orchestrator.runtime("a").unwrap().is_ready());
    assert_eq!(host.notifier.messages(), vec!["v1".to_string(), "v2".to_string()]);
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_start_is_retried_on_next_pass() {
    let host = test_host();
    host.install(manifest("a", &[]), "(module (func", true);
    host.orchestrator.sync().await;
    assert!(host.orchestrator.running_ids().is_empty());

    host.install(manifest("a", &[]), &noop_plugin(), true);
    host.orchestrator.sync().await;
    assert_eq!(host.orchestrator.running_ids(), vec!["a".to_string()]);
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn watcher_follows_registry_changes() {
    let host = test_host();
    host.install(manifest("a", &[]), &noop_plugin(), true);
    host.orchestrator.watch_registry();

    let running = |expected: Vec<&'static str>| {
        let orchestrator = host.orchestrator.clone();
        async move {
            for _ in 0..100 {
                if orchestrator.running_ids() == expected {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
    };

    assert!(running(vec!["a"]).await);
    host.install(manifest("b", &[]), &noop_plugin(), true);
    assert!(running(vec!["a", "b"]).await);
    host.registry.set_enabled("a", false).unwrap();
    assert!(running(vec!["b"]).await);
    host.orchestrator.shutdown().await;
    assert!(host.orchestrator.running_ids().is_empty());
}

// ── Command bridging ───────────────────────────────────────────

#[tokio::test]
async fn bridged_command_runs_in_the_owning_sandbox() {
    let host = test_host();
    host.install(
        with_command(manifest("a", &[Capability::StorageLocal]), "a.run"),
        &storage_plugin(),
        true,
    );
    host.install(
        with_command(manifest("b", &[Capability::StorageLocal]), "b.run"),
        &storage_plugin(),
        true,
    );
    host.orchestrator.sync().await;

    assert!(host.commands.run("b.run"));
    assert_eq!(host.wait_for_key("b", "invoked").await, Some(json!(true)));
    assert_eq!(host.stored("a", "invoked"), None);
    host.orchestrator.shutdown().await;
}

#[tokio::test]
async fn runtime_registered_commands_are_routable() {
    let host = test_host();
    let entry = WatPlugin::new()
        .on_activate(|l| l.call_drop("command.register", r#"[{"id":"a.dynamic","title":"Dynamic"}]"#))
        .on_invoke(|l| l.call_drop("storage.set", r#"["invoked","dynamic"]"#))
        .build();
    host.install(
        manifest("a", &[Capability::CommandRegister, Capability::StorageLocal]),
        &entry,
        true,
    );
    host.orchestrator.sync().await;

    assert!(host.orchestrator.execute_command("a.dynamic"));
    assert_eq!(host.wait_for_key("a", "invoked").await, Some(json!("dynamic")));
    assert!(!host.orchestrator.execute_command("nobody.owns.this"));

    host.orchestrator.shutdown().await;
    assert!(host.host_api.registered_commands("a").is_empty());
}

#[tokio::test]
async fn colliding_command_routes_to_first_plugin() {
    let host = test_host();
    host.install(
        with_command(manifest("a", &[Capability::StorageLocal]), "shared.run"),
        &storage_plugin(),
        true,
    );
    host.install(
        with_command(manifest("b", &[Capability::StorageLocal]), "shared.run"),
        &storage_plugin(),
        true,
    );
    host.orchestrator.sync().await;

    assert!(host.orchestrator.execute_command("shared.run"));
    assert_eq!(host.wait_for_key("a", "invoked").await, Some(json!(true)));
    assert_eq!(host.stored("b", "invoked"), None);
    host.orchestrator.shutdown().await;
}
