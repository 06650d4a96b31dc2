//! Application instances: channels shared across configurations and
//! services waiting on deferred objects

use sight_runtime::{
    AppInstance, ConfigLauncher, ConfigValue, FieldAdaptor, LauncherConfig, Runtime,
    RuntimeConfig, ServiceState,
};
use std::collections::HashMap;
use std::time::Duration;

const BUS: &str = r#"
configs:
  talker:
    parameters:
      - name: bus
    services:
      - uid: source
        type: sight::service::counter
    connections:
      - channel: ${bus}
        signals: [source/computed]
    start: [source]
  listener:
    parameters:
      - name: bus
    objects:
      - uid: total
        type: sight::data::integer
        value: 0
    services:
      - uid: sink
        type: sight::service::counter
        inout:
          - key: counter
            uid: total
    connections:
      - channel: ${bus}
        slots: [sink/add]
    start: [sink]
"#;

const PIPELINE: &str = r#"
configs:
  pipeline:
    objects:
      - uid: input
        type: sight::data::integer
        value: 3
      - uid: frame
        src: deferred
      - uid: total
        type: sight::data::integer
        value: 0
    services:
      - uid: grabber
        type: sight::service::copy
        in:
          - key: source
            uid: input
        out:
          - key: target
            uid: frame
      - uid: viewer
        type: sight::service::logger
        in:
          - key: frame
            uid: frame
      - uid: tally
        type: sight::service::counter
        inout:
          - key: counter
            uid: total
    connections:
      - signals: [viewer/updated]
        slots: [tally/update]
    start: [grabber, viewer, tally]
    update: [viewer]
"#;

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn build(runtime: &Runtime, config_id: &str, fields: &FieldAdaptor) -> AppInstance {
    let adapted = runtime
        .configs()
        .get_adapted_config(config_id, fields, true)
        .unwrap();
    AppInstance::build(runtime.clone(), &adapted, &HashMap::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_named_channel_links_instances() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.configs().load_yaml(BUS).unwrap();
    let mut fields = FieldAdaptor::new();
    fields.insert("bus".to_string(), ConfigValue::from("shared_bus"));

    let mut talker = build(&runtime, "talker", &fields).await;
    let mut listener = build(&runtime, "listener", &fields).await;
    assert_eq!(runtime.dispatch().channel_size("shared_bus"), 2);

    let source = runtime
        .registry()
        .get_service(&talker.resolve_uid("source"))
        .unwrap();
    let total = runtime
        .registry()
        .get_object(&listener.resolve_uid("total"))
        .unwrap();
    let flush = runtime.workers().default_worker();

    source.update().await.unwrap();
    flush.submit(|| async {}).await.unwrap();
    assert_eq!(total.value(), Some(ConfigValue::Int(1)));

    listener.teardown().await;
    assert_eq!(runtime.dispatch().channel_size("shared_bus"), 1);
    source.update().await.unwrap();
    flush.submit(|| async {}).await.unwrap();
    assert_eq!(total.value(), Some(ConfigValue::Int(1)));

    talker.teardown().await;
    assert_eq!(runtime.dispatch().channel_size("shared_bus"), 0);
    assert!(runtime.registry().is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_deferred_service_follows_its_object() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.configs().load_yaml(PIPELINE).unwrap();
    let launcher = ConfigLauncher::new(runtime.clone(), LauncherConfig::default());
    launcher.set_config("pipeline").await.unwrap();
    launcher.update().await.unwrap();

    let registry = runtime.registry();
    let viewer_id = launcher.resolve_uid("viewer").await.unwrap();
    let frame_id = launcher.resolve_uid("frame").await.unwrap();
    let total = registry
        .get_object(&launcher.resolve_uid("total").await.unwrap())
        .unwrap();
    let grabber = launcher.service("grabber").await.unwrap();
    assert!(launcher.service("viewer").await.is_none());
    assert!(!registry.contains(&viewer_id));

    // Publishing the frame creates, starts and updates the viewer
    grabber.update().await.unwrap();
    assert!(registry.contains(&frame_id));
    assert!(eventually(|| registry.get_service(&viewer_id).is_ok()).await);
    let viewer = registry.get_service(&viewer_id).unwrap();
    assert!(eventually(|| viewer.state() == ServiceState::Started).await);
    assert!(eventually(|| total.value() == Some(ConfigValue::Int(1))).await);

    // Withdrawing it removes the viewer again
    grabber.stop().await.unwrap();
    assert!(eventually(|| !registry.contains(&viewer_id)).await);
    assert!(eventually(|| viewer.state() == ServiceState::Destroyed).await);

    // A new frame brings up a new viewer, joined to the same channel
    grabber.configure(Default::default()).await.unwrap();
    grabber.start().await.unwrap();
    grabber.update().await.unwrap();
    assert!(eventually(|| registry.contains(&viewer_id)).await);
    assert!(eventually(|| total.value() == Some(ConfigValue::Int(2))).await);
    let second = registry.get_service(&viewer_id).unwrap();
    assert!(!second.ptr_eq(&viewer));

    launcher.stop().await;
    assert_eq!(second.state(), ServiceState::Destroyed);
    assert!(registry.is_empty());
    runtime.shutdown().await;
}
