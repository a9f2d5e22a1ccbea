//! Impls - ports の実装
//!
//! - **MemoryStore** / **JsonFileStore**: KvStore
//! - **HttpSink**: DeliverySink（reqwest）
//! - **FixtureExecutor**: 記録済みページを再生する BrowsingExecutor
//! - **RunnerLock**: ストアを使う runner を 1 本に絞る lock file

pub mod fixture_executor;
pub mod http_sink;
pub mod json_file_store;
pub mod memory_store;
pub mod runner_lock;

pub use self::fixture_executor::FixtureExecutor;
pub use self::http_sink::HttpSink;
pub use self::json_file_store::JsonFileStore;
pub use self::memory_store::MemoryStore;
pub use self::runner_lock::{LockError, LockGuard, RunnerLock};
