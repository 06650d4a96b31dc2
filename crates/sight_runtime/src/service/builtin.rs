//! Services shipped with the runtime

use crate::com::{Arg, ArgKind, Signature};
use crate::config::{ConfigTree, ConfigValue};
use crate::service::{Access, Service, ServiceContext, ServiceError};
use async_trait::async_trait;

/// Logs the bound inputs on every update
#[derive(Debug)]
pub struct LoggerService {
    message: String,
    updates: u64,
}

impl Default for LoggerService {
    fn default() -> Self {
        Self {
            message: "update".to_string(),
            updates: 0,
        }
    }
}

#[async_trait]
impl Service for LoggerService {
    async fn configuring(
        &mut self,
        _ctx: &ServiceContext,
        config: &ConfigTree,
    ) -> Result<(), ServiceError> {
        if let Some(message) = config.get("message") {
            self.message = message
                .as_str()
                .ok_or_else(|| ServiceError::Config("'message' must be a string".into()))?
                .to_string();
        }
        Ok(())
    }

    async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        self.updates += 1;
        log::info!("[{}] {} #{}", ctx.id(), self.message, self.updates);

        for binding in ctx.bindings().iter().filter(|b| b.access != Access::Out) {
            for index in 0..binding.uids.len() {
                match ctx.input_at(&binding.key, index) {
                    Ok(object) => {
                        let value = object
                            .value()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| format!("{} field(s)", object.read().fields.len()));
                        log::info!("[{}]   {} = {}", ctx.id(), object.id(), value);
                    }
                    Err(e) if binding.optional => log::debug!("[{}]   {}", ctx.id(), e),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// Counts updates and publishes the count.
///
/// The count is written to the optional `counter` inout object and emitted
/// with the `computed` signal. `step` sets the increment.
#[derive(Debug)]
pub struct CounterService {
    step: i64,
    count: i64,
}

pub const COUNTER_KEY: &str = "counter";
pub const COMPUTED_SIG: &str = "computed";
pub const RESET_SLOT: &str = "reset";
pub const ADD_SLOT: &str = "add";

impl Default for CounterService {
    fn default() -> Self {
        Self { step: 1, count: 0 }
    }
}

impl CounterService {
    fn publish(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        if ctx.binding(COUNTER_KEY).is_some() {
            let counter = ctx.inout(COUNTER_KEY)?;
            counter.assign(ConfigValue::Int(self.count))?;

            // Our own write must not trigger another update
            let _blocked = ctx.block_auto_connections();
            ctx.notify_modified(&counter)?;
        }
        ctx.async_emit(COMPUTED_SIG, vec![Arg::Int(self.count)])?;
        Ok(())
    }
}

#[async_trait]
impl Service for CounterService {
    fn signals(&self) -> Vec<(&'static str, Signature)> {
        vec![(COMPUTED_SIG, Signature::of(&[ArgKind::Int]))]
    }

    fn slots(&self) -> Vec<(&'static str, Signature)> {
        vec![
            (RESET_SLOT, Signature::empty()),
            (ADD_SLOT, Signature::of(&[ArgKind::Int])),
        ]
    }

    async fn configuring(
        &mut self,
        _ctx: &ServiceContext,
        config: &ConfigTree,
    ) -> Result<(), ServiceError> {
        self.step = match config.get("step") {
            None => 1,
            Some(step) => step
                .as_i64()
                .ok_or_else(|| ServiceError::Config("'step' must be an integer".into()))?,
        };
        Ok(())
    }

    async fn starting(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        self.count = 0;
        if ctx.binding(COUNTER_KEY).is_some() {
            let counter = ctx.inout(COUNTER_KEY)?;
            if let Some(ConfigValue::Int(initial)) = counter.value() {
                self.count = initial;
            }
        }
        Ok(())
    }

    async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        self.count += self.step;
        self.publish(ctx)
    }

    async fn call_slot(
        &mut self,
        ctx: &ServiceContext,
        key: &str,
        args: Vec<Arg>,
    ) -> Result<(), ServiceError> {
        match key {
            RESET_SLOT => self.count = 0,
            ADD_SLOT => self.count += args.first().and_then(Arg::as_int).unwrap_or(0),
            _ => return Err(ServiceError::UnknownSlot(key.to_string())),
        }
        self.publish(ctx)
    }
}

/// Copies the `source` input into the `target` output on every update.
///
/// `mode` is `deep` (default) or `shallow`.
#[derive(Debug, Default)]
pub struct CopyService {
    shallow: bool,
}

pub const SOURCE_KEY: &str = "source";
pub const TARGET_KEY: &str = "target";

#[async_trait]
impl Service for CopyService {
    async fn configuring(
        &mut self,
        _ctx: &ServiceContext,
        config: &ConfigTree,
    ) -> Result<(), ServiceError> {
        self.shallow = match config.get("mode").and_then(|m| m.as_str()) {
            None | Some("deep") => false,
            Some("shallow") => true,
            Some(other) => {
                return Err(ServiceError::Config(format!(
                    "unknown copy mode '{}'",
                    other
                )))
            }
        };
        Ok(())
    }

    async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let source = ctx.input(SOURCE_KEY)?;
        let uid = ctx.output_uid(TARGET_KEY)?.to_string();
        let copy = if self.shallow {
            source.shallow_copy(uid)
        } else {
            source.deep_copy(uid)
        };
        ctx.set_output(TARGET_KEY, Some(copy))
    }

    async fn stopping(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        ctx.set_output(TARGET_KEY, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataObject, INTEGER_TYPE};
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::service::{Binding, ServiceHandle, ServiceOptions, COPY_TYPE, COUNTER_TYPE};

    fn config(yaml: &str) -> ConfigTree {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_counter_writes_inout() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let counter = runtime
            .objects()
            .create(INTEGER_TYPE, "count", Some(ConfigValue::Int(10)))
            .unwrap();
        runtime.registry().register_object("count", counter.clone()).unwrap();

        let options = ServiceOptions {
            bindings: vec![Binding::inout(COUNTER_KEY, "count")],
            ..Default::default()
        };
        let srv = runtime.create_service(COUNTER_TYPE, "counter", options).unwrap();
        srv.configure(config("step: 5")).await.unwrap();
        srv.start().await.unwrap();
        srv.update().await.unwrap();
        srv.update().await.unwrap();
        assert_eq!(counter.value(), Some(ConfigValue::Int(20)));

        let add = crate::com::SlotTarget::slot(&srv, ADD_SLOT).unwrap();
        add.invoke(vec![Arg::Int(3)]).await.unwrap();
        assert_eq!(counter.value(), Some(ConfigValue::Int(23)));
    }

    #[tokio::test]
    async fn test_counter_rejects_bad_step() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let srv = runtime
            .create_service(COUNTER_TYPE, "counter", ServiceOptions::default())
            .unwrap();
        assert!(srv.configure(config("step: fast")).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_publishes_output() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let source = runtime
            .objects()
            .create(INTEGER_TYPE, "src", Some(ConfigValue::Int(7)))
            .unwrap();
        runtime.registry().register_object("src", source.clone()).unwrap();

        let options = ServiceOptions {
            bindings: vec![
                Binding::input(SOURCE_KEY, "src"),
                Binding::output(TARGET_KEY, "dst"),
            ],
            ..Default::default()
        };
        let srv = runtime.create_service(COPY_TYPE, "copier", options).unwrap();
        srv.configure(ConfigTree::Null).await.unwrap();
        srv.start().await.unwrap();
        assert!(!runtime.registry().contains("dst"));

        srv.update().await.unwrap();
        let copy: std::sync::Arc<DataObject> = runtime.registry().get_object("dst").unwrap();
        assert_eq!(copy.id(), "dst");
        assert_eq!(copy.value(), Some(ConfigValue::Int(7)));
        assert!(!std::sync::Arc::ptr_eq(&copy, &source));

        // A second update replaces the published output
        srv.update().await.unwrap();
        assert!(runtime.registry().contains("dst"));

        srv.stop().await.unwrap();
        assert!(!runtime.registry().contains("dst"));
        srv.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_rejects_unknown_mode() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let srv = runtime
            .create_service(COPY_TYPE, "copier", ServiceOptions::default())
            .unwrap();
        let result = srv.configure(config("mode: mirror")).await;
        assert!(result.is_err());
        assert_eq!(srv.state(), crate::service::ServiceState::Created);
    }
}
