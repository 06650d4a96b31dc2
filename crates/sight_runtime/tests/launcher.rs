//! Launcher scenarios driven from YAML configurations

use sight_runtime::app::SET_CONFIG_SLOT;
use sight_runtime::prelude::*;
use sight_runtime::service::builtin::COUNTER_KEY;
use sight_runtime::{
    ConfigError, ConfigLauncher, LauncherConfig, LauncherError, LauncherState, LifecycleError,
    RegistryError, Runtime, RuntimeConfig, ServiceOptions, ServiceState, SurvivalPolicy,
};
use std::time::Duration;

/// Asks for configuration `B` from its update hook
#[derive(Default)]
struct Switcher;

#[async_trait]
impl Service for Switcher {
    fn signals(&self) -> Vec<(&'static str, Signature)> {
        vec![("switch", Signature::of(&[ArgKind::String]))]
    }

    async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        ctx.emit("switch", vec![Arg::from("B")]).await
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

const APP: &str = r#"
version: "1.0"
configs:
  A:
    group: switch
    services:
      - uid: srv1
        type: sight::service::logger
    start: [srv1]
  B:
    group: switch
    services:
      - uid: srv2
        type: sight::service::logger
    start: [srv2]
  chain:
    group: counters
    parameters:
      - name: step
        default: 2
    objects:
      - uid: total
        type: sight::data::integer
        value: 0
    services:
      - uid: source
        type: sight::service::counter
        config:
          step: ${step}
      - uid: sink
        type: sight::service::counter
        inout:
          - key: counter
            uid: total
    connections:
      - signals: [source/computed]
        slots: [sink/add]
    start: [source, sink]
    update: [source]
  broken:
    services:
      - uid: good
        type: sight::service::logger
      - uid: bad
        type: sight::service::teleporter
    start: [good, bad]
  misconfigured:
    services:
      - uid: first
        type: sight::service::logger
      - uid: second
        type: sight::service::counter
        config:
          step: fast
  miswired:
    objects:
      - uid: level
        type: sight::data::integer
    services:
      - uid: sink
        type: sight::service::counter
    connections:
      - signals: [sink/computed]
        slots: [level/add]
  dangling:
    services:
      - uid: reader
        type: sight::service::logger
        in:
          - key: image
            uid: nowhere
"#;

const KEYED: &str = r#"
configs:
  first:
    objects:
      - uid: key
        type: sight::data::string
        value: shared
      - uid: scratch
        type: sight::data::integer
    services:
      - uid: viewer
        type: sight::service::logger
        in:
          - key: key
            uid: key
    start: [viewer]
  second:
    objects:
      - uid: key
        type: sight::data::string
    services:
      - uid: viewer
        type: sight::service::logger
        in:
          - key: key
            uid: key
    start: [viewer]
"#;

fn runtime_with(yaml: &str) -> Runtime {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.configs().load_yaml(yaml).unwrap();
    runtime
}

#[tokio::test]
async fn test_switch_between_configurations() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());

    launcher.set_config("A").await.unwrap();
    assert_eq!(launcher.state(), LauncherState::Idle);
    launcher.update().await.unwrap();
    assert_eq!(launcher.state(), LauncherState::Running("A".to_string()));

    let first_srv1 = launcher.service_id("srv1").await.unwrap();
    assert_ne!(first_srv1, "srv1");
    let srv1 = runtime.registry().get_service(&first_srv1).unwrap();
    assert_eq!(srv1.state(), ServiceState::Started);

    // Running launchers switch as soon as another configuration is selected
    launcher.set_config("B").await.unwrap();
    launcher.update().await.unwrap();
    assert_eq!(launcher.state(), LauncherState::Running("B".to_string()));
    assert!(matches!(
        runtime.registry().get_service(&first_srv1),
        Err(RegistryError::NotFound(_))
    ));
    assert_eq!(srv1.state(), ServiceState::Destroyed);

    let srv2_id = launcher.service_id("srv2").await.unwrap();
    let srv2 = runtime.registry().get_service(&srv2_id).unwrap();
    assert_eq!(srv2.state(), ServiceState::Started);

    launcher.set_config("A").await.unwrap();
    let second_srv1 = launcher.service_id("srv1").await.unwrap();
    assert_ne!(first_srv1, second_srv1);
    assert_eq!(
        runtime.registry().get_service(&second_srv1).unwrap().state(),
        ServiceState::Started
    );
    assert_eq!(srv2.state(), ServiceState::Destroyed);
    assert!(!runtime.registry().contains(&srv2_id));

    // Updating the running configuration builds nothing new
    let ids = runtime.registry().ids();
    launcher.update().await.unwrap();
    assert_eq!(launcher.service_id("srv1").await, Some(second_srv1));
    assert_eq!(runtime.registry().ids(), ids);

    launcher.stop().await;
    assert_eq!(launcher.state(), LauncherState::Idle);
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_connections_and_update_list() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());

    launcher.set_config("chain").await.unwrap();
    launcher.update().await.unwrap();

    // source/computed was queued onto the default worker by the update list
    runtime
        .workers()
        .default_worker()
        .submit(|| async {})
        .await
        .unwrap();

    let total_id = launcher.resolve_uid("total").await.unwrap();
    let total = runtime.registry().get_object(&total_id).unwrap();
    assert_eq!(total.value(), Some(ConfigValue::Int(2)));

    let sink = launcher.service("sink").await.unwrap();
    assert_eq!(sink.context().binding(COUNTER_KEY).unwrap().uids, vec![total_id]);

    launcher.stop().await;
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_parameters_from_launcher_fields() {
    let runtime = runtime_with(APP);
    let mut config = LauncherConfig::default();
    config.fields.insert("step".to_string(), ConfigValue::Int(5));
    let launcher = ConfigLauncher::new(runtime.clone(), config);

    launcher.set_config("chain").await.unwrap();
    launcher.update().await.unwrap();
    runtime
        .workers()
        .default_worker()
        .submit(|| async {})
        .await
        .unwrap();

    let total_id = launcher.resolve_uid("total").await.unwrap();
    let total = runtime.registry().get_object(&total_id).unwrap();
    assert_eq!(total.value(), Some(ConfigValue::Int(5)));

    launcher.stop().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_configuration_keeps_launcher_idle() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());

    let result = launcher.set_config("C").await;
    assert!(matches!(
        result,
        Err(LauncherError::Config(ConfigError::UnknownConfig(_)))
    ));
    assert_eq!(launcher.state(), LauncherState::Idle);
    assert!(runtime.registry().is_empty());

    // A running configuration survives a rejected selection
    launcher.set_config("A").await.unwrap();
    launcher.update().await.unwrap();
    let srv1 = launcher.service_id("srv1").await.unwrap();
    assert!(launcher.set_config("C").await.is_err());
    assert_eq!(launcher.state(), LauncherState::Running("A".to_string()));
    assert!(runtime.registry().contains(&srv1));

    launcher.stop().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_service_type_unwinds_build() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());

    launcher.set_config("broken").await.unwrap();
    let result = launcher.update().await;
    assert!(matches!(
        result,
        Err(LauncherError::UnknownServiceType(t)) if t == "sight::service::teleporter"
    ));
    assert_eq!(launcher.state(), LauncherState::Idle);
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_configure_failure_unwinds_build() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());

    launcher.set_config("misconfigured").await.unwrap();
    let result = launcher.update().await;
    assert!(matches!(
        result,
        Err(LauncherError::Lifecycle(LifecycleError::Failed { .. }))
    ));
    assert_eq!(launcher.state(), LauncherState::Idle);
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_missing_input_object_is_rejected() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(
        runtime.clone(),
        LauncherConfig {
            auto_prefix: false,
            ..Default::default()
        },
    );

    launcher.set_config("dangling").await.unwrap();
    let result = launcher.update().await;
    assert!(matches!(
        result,
        Err(LauncherError::UnknownObject(uid)) if uid == "nowhere"
    ));
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_surviving_object_is_reused() {
    let runtime = runtime_with(KEYED);
    let launcher = ConfigLauncher::new(
        runtime.clone(),
        LauncherConfig {
            survival: SurvivalPolicy::keep_uids(&["key"]),
            ..Default::default()
        },
    );

    launcher.set_config("first").await.unwrap();
    launcher.update().await.unwrap();
    let first_key = runtime
        .registry()
        .get_object(&launcher.resolve_uid("key").await.unwrap())
        .unwrap();

    launcher.set_config("second").await.unwrap();
    assert_eq!(launcher.survivors().await, vec!["key".to_string()]);

    let second_id = launcher.resolve_uid("key").await.unwrap();
    let second_key = runtime.registry().get_object(&second_id).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first_key, &second_key));
    assert_eq!(second_key.value(), Some(ConfigValue::from("shared")));
    assert!(runtime.registry().ids().iter().all(|id| !id.ends_with("_scratch")));

    launcher.stop().await;
    assert!(launcher.survivors().await.is_empty());
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_select_from_key_object() {
    let runtime = runtime_with(KEYED);
    let mut config = LauncherConfig::default();
    config
        .key_map
        .insert("ct".to_string(), "second".to_string());
    let launcher = ConfigLauncher::new(runtime.clone(), config);

    let key = runtime
        .create_object("sight::data::string", "modality", Some(ConfigValue::from("ct")))
        .unwrap();
    launcher.set_config_from_object(&key).await.unwrap();
    assert_eq!(launcher.selected().await.as_deref(), Some("second"));

    let empty = runtime
        .create_object("sight::data::composite", "empty", None)
        .unwrap();
    assert!(matches!(
        launcher.set_config_from_object(&empty).await,
        Err(LauncherError::InvalidKey(_))
    ));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_load_configuration_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.yaml");
    std::fs::write(&path, KEYED).unwrap();

    let runtime = Runtime::new(RuntimeConfig::default());
    let ids = runtime.configs().load_file(&path).unwrap();
    assert_eq!(ids, vec!["first".to_string(), "second".to_string()]);

    let missing = runtime.configs().load_file(dir.path().join("missing.yaml"));
    assert!(missing.is_err());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_switch_requested_from_service_hook() {
    let runtime = runtime_with(APP);
    runtime
        .services()
        .register_default::<Switcher>("test::switcher");
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());
    launcher.set_config("A").await.unwrap();
    launcher.update().await.unwrap();

    let switcher = runtime
        .create_service("test::switcher", "switcher", ServiceOptions::default())
        .unwrap();
    switcher.configure(ConfigTree::Null).await.unwrap();
    switcher.start().await.unwrap();
    let connection = runtime
        .dispatch()
        .connect(&switcher, "switch", &launcher, SET_CONFIG_SLOT)
        .unwrap();

    // The hook shares the default worker with the services the switch stops
    let updated = tokio::time::timeout(Duration::from_secs(3), switcher.update()).await;
    assert!(matches!(updated, Ok(Ok(()))));
    assert!(eventually(|| launcher.state() == LauncherState::Running("B".to_string())).await);
    assert!(launcher.service_id("srv1").await.is_none());

    runtime.dispatch().disconnect(&connection);
    switcher.stop().await.unwrap();
    switcher.destroy().await.unwrap();
    launcher.stop().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_slot_endpoint_naming_an_object_is_rejected() {
    let runtime = runtime_with(APP);
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());
    launcher.set_config("miswired").await.unwrap();

    let result = launcher.update().await;
    assert!(matches!(
        result,
        Err(LauncherError::Registry(RegistryError::WrongKind {
            expected: "service",
            found: "object",
            ..
        }))
    ));
    assert_eq!(launcher.state(), LauncherState::Idle);
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}
