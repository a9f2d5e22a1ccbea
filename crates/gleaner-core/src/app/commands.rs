//! Commands - 制御面（enqueue / pause / resume / stop / getStatus）
//!
//! `Command` はタグ付き enum、`CommandRegistry` が `CommandKind → handler` の
//! 明示的なディスパッチテーブルです。handler は状態を持たず、呼び出しごとに
//! `Scheduler` を受け取ります。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::scheduler::Scheduler;
use super::status::SchedulerStatus;
use crate::domain::{GleanerError, RunId};
use crate::queue::{EnqueueReport, TaskOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Enqueue {
        keywords: Vec<String>,
        #[serde(default)]
        options: TaskOptions,
    },
    Pause,
    Resume,
    Stop,
    GetStatus,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Enqueue { .. } => CommandKind::Enqueue,
            Command::Pause => CommandKind::Pause,
            Command::Resume => CommandKind::Resume,
            Command::Stop => CommandKind::Stop,
            Command::GetStatus => CommandKind::GetStatus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Enqueue,
    Pause,
    Resume,
    Stop,
    GetStatus,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Enqueue,
        CommandKind::Pause,
        CommandKind::Resume,
        CommandKind::Stop,
        CommandKind::GetStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Enqueue => "enqueue",
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Stop => "stop",
            CommandKind::GetStatus => "getStatus",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum CommandResponse {
    Enqueued(EnqueueReport),
    Paused,
    Resumed,
    Stopped { run_id: Option<RunId> },
    Status(Box<SchedulerStatus>),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no handler registered for command '{0}'")]
    NotRegistered(CommandKind),

    #[error("handler for '{expected}' received a '{got}' command")]
    Mismatch {
        expected: CommandKind,
        got: CommandKind,
    },

    #[error(transparent)]
    Gleaner(#[from] GleanerError),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for command '{0}' is already registered")]
    AlreadyRegistered(CommandKind),
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        command: Command,
    ) -> Result<CommandResponse, CommandError>;
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every kind.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in CommandKind::ALL {
            registry.handlers.insert(kind, standard_handler(kind));
        }
        registry
    }

    pub fn register(
        &mut self,
        kind: CommandKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Fill every kind that has no handler yet with the built-in one.
    pub fn fill_standard(&mut self) {
        for kind in CommandKind::ALL {
            self.handlers
                .entry(kind)
                .or_insert_with(|| standard_handler(kind));
        }
    }

    pub fn registered_kinds(&self) -> Vec<CommandKind> {
        self.handlers.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        scheduler: &Scheduler,
        command: Command,
    ) -> Result<CommandResponse, CommandError> {
        let kind = command.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(CommandError::NotRegistered(kind))?;
        handler.handle(scheduler, command).await
    }
}

fn standard_handler(kind: CommandKind) -> Arc<dyn CommandHandler> {
    match kind {
        CommandKind::Enqueue => Arc::new(EnqueueHandler),
        CommandKind::Pause => Arc::new(PauseHandler),
        CommandKind::Resume => Arc::new(ResumeHandler),
        CommandKind::Stop => Arc::new(StopHandler),
        CommandKind::GetStatus => Arc::new(StatusHandler),
    }
}

pub struct EnqueueHandler;

#[async_trait]
impl CommandHandler for EnqueueHandler {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        command: Command,
    ) -> Result<CommandResponse, CommandError> {
        match command {
            Command::Enqueue { keywords, options } => {
                let report = scheduler.enqueue(&keywords, &options).await?;
                Ok(CommandResponse::Enqueued(report))
            }
            other => Err(CommandError::Mismatch {
                expected: CommandKind::Enqueue,
                got: other.kind(),
            }),
        }
    }
}

pub struct PauseHandler;

#[async_trait]
impl CommandHandler for PauseHandler {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        _command: Command,
    ) -> Result<CommandResponse, CommandError> {
        scheduler.pause().await?;
        Ok(CommandResponse::Paused)
    }
}

pub struct ResumeHandler;

#[async_trait]
impl CommandHandler for ResumeHandler {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        _command: Command,
    ) -> Result<CommandResponse, CommandError> {
        scheduler.resume().await?;
        Ok(CommandResponse::Resumed)
    }
}

pub struct StopHandler;

#[async_trait]
impl CommandHandler for StopHandler {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        _command: Command,
    ) -> Result<CommandResponse, CommandError> {
        let run_id = scheduler.stop().await?;
        Ok(CommandResponse::Stopped { run_id })
    }
}

pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(
        &self,
        scheduler: &Scheduler,
        _command: Command,
    ) -> Result<CommandResponse, CommandError> {
        Ok(CommandResponse::Status(Box::new(scheduler.status().await)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SchedulerBuilder;
    use crate::impls::MemoryStore;
    use crate::testing::{RecordingSink, ScriptedExecutor};
    use serde_json::json;

    fn scheduler() -> Scheduler {
        SchedulerBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .executor(Arc::new(ScriptedExecutor::new()))
            .sink(Arc::new(RecordingSink::new()))
            .build()
            .unwrap()
            .scheduler
    }

    #[test]
    fn commands_decode_from_tagged_json() {
        let command: Command = serde_json::from_value(json!({
            "command": "enqueue",
            "keywords": ["rust"],
            "options": {"categories": ["jobs"], "priority_tier": "HIGH"}
        }))
        .unwrap();
        let Command::Enqueue { keywords, options } = command else {
            panic!("expected enqueue");
        };
        assert_eq!(keywords, vec!["rust".to_string()]);
        assert_eq!(options.categories.len(), 1);
        assert_eq!(options.max_pages_per_category, 10);

        let command: Command = serde_json::from_value(json!({"command": "getStatus"})).unwrap();
        assert_eq!(command.kind(), CommandKind::GetStatus);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = CommandRegistry::new();
        registry
            .register(CommandKind::Pause, Arc::new(PauseHandler))
            .unwrap();
        let err = registry
            .register(CommandKind::Pause, Arc::new(PauseHandler))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(CommandKind::Pause)));
    }

    #[tokio::test]
    async fn unregistered_kind_is_an_error() {
        let registry = CommandRegistry::new();
        let err = registry
            .dispatch(&scheduler(), Command::Pause)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotRegistered(CommandKind::Pause)));
    }

    #[tokio::test]
    async fn standard_registry_dispatches_every_kind() {
        let registry = CommandRegistry::standard();
        let scheduler = scheduler();

        let response = registry
            .dispatch(
                &scheduler,
                Command::Enqueue {
                    keywords: vec!["rust".into(), "RUST".into()],
                    options: TaskOptions::default(),
                },
            )
            .await
            .unwrap();
        let CommandResponse::Enqueued(report) = response else {
            panic!("expected an enqueue report");
        };
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.skipped, vec!["RUST".to_string()]);

        assert_eq!(
            registry.dispatch(&scheduler, Command::Pause).await.unwrap(),
            CommandResponse::Paused
        );
        let CommandResponse::Status(status) =
            registry.dispatch(&scheduler, Command::GetStatus).await.unwrap()
        else {
            panic!("expected a status");
        };
        assert!(status.paused);
        assert_eq!(status.queue.pending, 1);

        assert_eq!(
            registry.dispatch(&scheduler, Command::Resume).await.unwrap(),
            CommandResponse::Resumed
        );
        assert_eq!(
            registry.dispatch(&scheduler, Command::Stop).await.unwrap(),
            CommandResponse::Stopped { run_id: None }
        );
    }

    #[tokio::test]
    async fn handler_rejects_a_foreign_command() {
        let err = EnqueueHandler
            .handle(&scheduler(), Command::Stop)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Mismatch { expected: CommandKind::Enqueue, got: CommandKind::Stop }
        ));
    }
}
