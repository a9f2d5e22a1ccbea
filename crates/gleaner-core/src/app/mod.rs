//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューラを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: ワイヤリングと起動時検証
//! - **Scheduler**: backlog の選択、アクティブ Run のライフサイクル、pause / resume / stop
//! - **runner**: アクティブ Run 1 本を進める driver タスク
//! - **TickLoop**: 一定間隔で tick を回す
//! - **CommandRegistry**: 制御コマンドのディスパッチ

pub mod builder;
pub mod commands;
mod runner;
pub mod scheduler;
pub mod status;
pub mod tick_loop;

pub use self::builder::{App, BuildError, SchedulerBuilder};
pub use self::commands::{
    Command, CommandError, CommandHandler, CommandKind, CommandRegistry, CommandResponse,
    RegistryError,
};
pub use self::runner::RunControl;
pub use self::scheduler::{
    RestoreReport, Scheduler, SchedulerMeta, SchedulerSettings, TickAction, TickReport,
};
pub use self::status::{ActiveRunView, SchedulerStatus};
pub use self::tick_loop::TickLoop;
