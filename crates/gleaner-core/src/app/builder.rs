//! SchedulerBuilder - Scheduler の構築とワイヤリング
//!
//! - store / executor / sink は必須。clock / id 生成 / decider は既定値あり
//! - `expect_commands` で必要なコマンドを宣言すると、build 時に不足を検出（Fail-fast）

use std::sync::Arc;
use std::time::Duration;

use super::commands::{
    Command, CommandError, CommandHandler, CommandKind, CommandRegistry, CommandResponse,
    RegistryError,
};
use super::scheduler::{Scheduler, SchedulerParts, SchedulerSettings};
use crate::config::GleanerConfig;
use crate::delivery::{DeliveryBuffer, TelemetryDebouncer};
use crate::domain::{Decider, DefaultDecider};
use crate::monitor::{HealthMarkers, Throttle, ThrottlePolicy};
use crate::ports::{
    BrowsingExecutor, Clock, DeliverySink, IdGenerator, KvStore, SystemClock, UlidGenerator,
};
use crate::queue::RetryPolicy;

/// # 使用例
/// ```ignore
/// let app = SchedulerBuilder::from_config(&config)
///     .store(Arc::new(JsonFileStore::new(&config.store.dir)))
///     .executor(Arc::new(FixtureExecutor::new(&config.executor.fixtures_dir)))
///     .sink(Arc::new(sink))
///     .with_standard_commands()
///     .expect_commands(&CommandKind::ALL)
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    store: Option<Arc<dyn KvStore>>,
    executor: Option<Arc<dyn BrowsingExecutor>>,
    sink: Option<Arc<dyn DeliverySink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    settings: SchedulerSettings,
    retry_policy: RetryPolicy,
    throttle_policy: ThrottlePolicy,
    markers: HealthMarkers,
    delivery_capacity: usize,
    sink_timeout: Duration,
    telemetry_interval: Duration,
    commands: CommandRegistry,
    standard_commands: bool,
    expected_commands: Option<Vec<CommandKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no {0} configured")]
    MissingComponent(&'static str),

    #[error("Missing command handlers: {0:?}. These commands were expected but not registered.")]
    MissingCommands(Vec<CommandKind>),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            executor: None,
            sink: None,
            clock: None,
            ids: None,
            decider: None,
            settings: SchedulerSettings::default(),
            retry_policy: RetryPolicy::default(),
            throttle_policy: ThrottlePolicy::default(),
            markers: HealthMarkers::default(),
            delivery_capacity: 3000,
            sink_timeout: Duration::from_secs(10),
            telemetry_interval: Duration::from_secs(10),
            commands: CommandRegistry::new(),
            standard_commands: false,
            expected_commands: None,
        }
    }

    /// Policies and tunables from the loaded configuration.
    pub fn from_config(config: &GleanerConfig) -> Self {
        Self::new()
            .settings(config.scheduler_settings())
            .retry_policy(config.retry_policy())
            .throttle_policy(config.throttle_policy())
            .health_markers(config.health.clone())
            .delivery_capacity(config.delivery.capacity)
            .sink_timeout(config.sink_timeout())
            .telemetry_interval(config.telemetry_interval())
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn BrowsingExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle_policy = policy;
        self
    }

    pub fn health_markers(mut self, markers: HealthMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn delivery_capacity(mut self, capacity: usize) -> Self {
        self.delivery_capacity = capacity;
        self
    }

    pub fn sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Register a custom handler. Fails if `kind` already has one.
    pub fn command(
        mut self,
        kind: CommandKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, RegistryError> {
        self.commands.register(kind, handler)?;
        Ok(self)
    }

    /// Built-in handlers for every kind without a custom one.
    pub fn with_standard_commands(mut self) -> Self {
        self.standard_commands = true;
        self
    }

    pub fn expect_commands(mut self, kinds: &[CommandKind]) -> Self {
        self.expected_commands = Some(kinds.to_vec());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let store = self.store.ok_or(BuildError::MissingComponent("store"))?;
        let executor = self
            .executor
            .ok_or(BuildError::MissingComponent("browsing executor"))?;
        let sink = self.sink.ok_or(BuildError::MissingComponent("delivery sink"))?;

        let mut commands = self.commands;
        if self.standard_commands {
            commands.fill_standard();
        }
        if let Some(expected) = &self.expected_commands {
            let registered = commands.registered_kinds();
            let missing: Vec<CommandKind> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingCommands(missing));
            }
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let decider: Arc<dyn Decider> = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.retry_policy.clone())));

        let delivery = DeliveryBuffer::new(
            sink.clone(),
            store.clone(),
            clock.clone(),
            self.delivery_capacity,
            self.sink_timeout,
        );
        let telemetry = TelemetryDebouncer::new(
            sink.clone(),
            clock.clone(),
            self.telemetry_interval,
            self.sink_timeout,
        );

        let scheduler = Scheduler::from_parts(SchedulerParts {
            store,
            executor,
            sink,
            clock,
            ids,
            decider,
            delivery,
            telemetry,
            throttle: Throttle::new(self.throttle_policy),
            markers: self.markers,
            settings: self.settings,
            default_max_retries: self.retry_policy.max_retries,
            sink_timeout: self.sink_timeout,
        });
        Ok(App {
            scheduler,
            commands,
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired Scheduler plus its command table.
pub struct App {
    pub scheduler: Scheduler,
    pub commands: CommandRegistry,
}

impl App {
    pub async fn dispatch(&self, command: Command) -> Result<CommandResponse, CommandError> {
        self.commands.dispatch(&self.scheduler, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::commands::PauseHandler;
    use crate::impls::MemoryStore;
    use crate::testing::{RecordingSink, ScriptedExecutor};

    fn wired() -> SchedulerBuilder {
        SchedulerBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .executor(Arc::new(ScriptedExecutor::new()))
            .sink(Arc::new(RecordingSink::new()))
    }

    #[test]
    fn missing_store_fails_fast() {
        let result = SchedulerBuilder::new()
            .executor(Arc::new(ScriptedExecutor::new()))
            .sink(Arc::new(RecordingSink::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingComponent("store"))));
    }

    #[test]
    fn expected_commands_must_be_registered() {
        let result = wired()
            .command(CommandKind::Pause, Arc::new(PauseHandler))
            .unwrap()
            .expect_commands(&[CommandKind::Pause, CommandKind::Stop])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingCommands(missing)) if missing == vec![CommandKind::Stop]
        ));
    }

    #[test]
    fn standard_commands_cover_every_kind() {
        let result = wired()
            .command(CommandKind::Pause, Arc::new(PauseHandler))
            .unwrap()
            .with_standard_commands()
            .expect_commands(&CommandKind::ALL)
            .build();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn app_dispatches_through_its_registry() {
        let app = wired().with_standard_commands().build().unwrap();
        let response = app.dispatch(Command::Pause).await.unwrap();
        assert_eq!(response, CommandResponse::Paused);
        assert!(app.scheduler.status().await.paused);
    }
}
