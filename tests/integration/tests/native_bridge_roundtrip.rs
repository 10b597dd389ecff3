use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tether_intercept::{ActionPatcher, ExtensionScope, InterceptVerdict, InterceptorRegistry};
use tether_ipc::{ChannelRenderer, IpcMain, RendererMessage};
use tether_native::{
    trust_response_channel, FnModule, HostConfig, HostServices, NativeModule, PrivilegedHost,
    RequireShim, ScriptEvaluator, StaticModuleLoader,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Accepts `export <name> <json>` and `require <id>` lines.
struct ConstEvaluator;

impl ScriptEvaluator for ConstEvaluator {
    fn evaluate(
        &self,
        code: &str,
        _origin: &str,
        require: &mut RequireShim,
    ) -> Result<Arc<dyn NativeModule>> {
        let mut module = FnModule::new();
        for line in code.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if let Some(id) = line.strip_prefix("require ") {
                require.require(id)?;
            } else if let Some(rest) = line.strip_prefix("export ") {
                let (name, raw) = rest.split_once(' ').context("malformed export")?;
                let value: Value = serde_json::from_str(raw)?;
                module = module.with_sync_export(name, move |_| Ok(value.clone()));
            } else {
                bail!("unsupported statement '{line}'");
            }
        }
        Ok(Arc::new(module))
    }
}

fn config_in(root: &Path) -> HostConfig {
    HostConfig {
        bundle_dir: root.join("bundle"),
        app_dir: root.join("app"),
        user_data_dir: root.join("user-data"),
        ..HostConfig::default()
    }
}

fn start_host(
    config: HostConfig,
    loader: StaticModuleLoader,
) -> (PrivilegedHost, UnboundedReceiver<RendererMessage>) {
    let (renderer, requests) = ChannelRenderer::new();
    let services = HostServices {
        loader: Arc::new(loader),
        evaluator: Arc::new(ConstEvaluator),
        builtins: BTreeMap::new(),
    };
    let host = PrivilegedHost::new(config, services, Arc::new(renderer));
    host.install();
    (host, requests)
}

/// Restricted side: answers every trust prompt with `decision` and records
/// the plugin labels it was shown.
fn spawn_trust_dialog(
    ipc: Arc<IpcMain>,
    mut requests: UnboundedReceiver<RendererMessage>,
    decision: u64,
) -> Arc<Mutex<Vec<String>>> {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&prompts);
    tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            if message.channel != "tether.requestTrust" {
                continue;
            }
            let label = message.args[0].as_str().unwrap_or_default().to_string();
            let hash = message.args[1].as_str().unwrap_or_default().to_string();
            let timestamp = message.args[2].as_u64().unwrap_or_default();
            seen.lock().expect("prompts").push(label);
            ipc.emit(
                &trust_response_channel("tether", &hash, timestamp),
                vec![json!(decision)],
            );
        }
    });
    prompts
}

#[tokio::test]
async fn integration_always_allow_survives_host_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let payload = "export lyrics \"synced\"";

    let (host, requests) = start_host(config_in(temp.path()), StaticModuleLoader::new());
    let prompts = spawn_trust_dialog(Arc::clone(host.ipc()), requests, 2);
    let result = host
        .ipc()
        .invoke("tether.registerNative", vec![json!(payload), json!("Lyrics")])
        .await
        .expect("approved payload");
    assert_eq!(result, Value::Null);
    assert_eq!(*prompts.lock().expect("prompts"), vec!["Lyrics".to_string()]);

    let (restarted, requests) = start_host(config_in(temp.path()), StaticModuleLoader::new());
    let prompts = spawn_trust_dialog(Arc::clone(restarted.ipc()), requests, 0);
    restarted
        .ipc()
        .invoke("tether.registerNative", vec![json!(payload), json!("Lyrics")])
        .await
        .expect("trusted payload runs without prompting");
    assert!(prompts.lock().expect("prompts").is_empty());
}

#[tokio::test]
async fn integration_blocked_payload_reports_plugin_and_never_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (host, requests) = start_host(config_in(temp.path()), StaticModuleLoader::new());
    let prompts = spawn_trust_dialog(Arc::clone(host.ipc()), requests, 0);

    // Evaluation of this payload would fail; blocking must stop it first.
    let error = host
        .ipc()
        .invoke("tether.registerNative", vec![json!("not a statement"), json!("Visualizer")])
        .await
        .expect_err("blocked");
    let message = error.to_string();
    assert!(message.contains("Visualizer"));
    assert!(message.contains("blocked"));
    assert_eq!(prompts.lock().expect("prompts").len(), 1);
}

#[tokio::test]
async fn integration_interceptor_forwards_actions_into_native_module() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_in(temp.path());
    std::fs::create_dir_all(&config.bundle_dir).expect("bundle dir");
    std::fs::write(config.bundle_dir.join("scrobbler.native.mjs"), "").expect("module file");

    let (recorded_tx, mut recorded_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    let scrobbler = FnModule::new().with_sync_export("record", move |args| {
        recorded_tx.send(args).ok();
        Ok(Value::Null)
    });
    let loader = StaticModuleLoader::new().with_module("scrobbler.native.mjs", Arc::new(scrobbler));
    let (host, _requests) = start_host(config, loader);

    let channel = host
        .ipc()
        .invoke(
            "tether.loadNative",
            vec![json!("scrobbler.native.mjs"), json!("scrobbler")],
        )
        .await
        .expect("loadNative");
    let channel = channel.as_str().expect("channel name").to_string();

    let registry = InterceptorRegistry::new();
    let patcher = ActionPatcher::new(registry.clone());
    patcher.patch("playback/skip", |args| {
        json!({ "type": "playback/skip", "payload": args.first().cloned() })
    });

    let scope = ExtensionScope::new("scrobbler", registry.clone());
    let ipc = Arc::clone(host.ipc());
    scope.intercept("playback/skip", false, move |args| {
        let ipc = Arc::clone(&ipc);
        let channel = channel.clone();
        let mut call = vec![json!("record")];
        call.extend(args.iter().cloned());
        Ok(InterceptVerdict::deferred(async move {
            ipc.invoke(&channel, call).await?;
            Ok(())
        }))
    });

    let action = patcher
        .dispatch("playback/skip", &[json!(7)])
        .expect("patched builder");
    assert_eq!(action, json!({ "type": "playback/skip", "payload": 7 }));
    assert_eq!(recorded_rx.recv().await, Some(vec![json!(7)]));

    let report = scope.unload().await;
    assert_eq!(report.completed, 1);
    assert!(!registry.has_subscribers("playback/skip"));
}

#[tokio::test]
async fn integration_load_native_rejects_traversal_before_touching_disk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (host, _requests) = start_host(config_in(temp.path()), StaticModuleLoader::new());

    for file_name in ["../evil.mjs", "a/b.mjs"] {
        let error = host
            .ipc()
            .invoke("tether.loadNative", vec![json!(file_name), json!("evil")])
            .await
            .expect_err("rejected file name");
        assert!(error.to_string().contains("security error"));
    }
    assert!(!host.ipc().has_handler("tetherNative.evil"));
}
