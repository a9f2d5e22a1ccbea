//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。外部コラボレータ（ブラウザ、
//! 下流 Sink、永続化ストア）と時刻・ID 生成をここで trait に切り出し、
//! スケジューラ本体からは実装の詳細を隠します。

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod sink;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{BrowsingExecutor, Enrichment, ExecutorError, ListPage, Observation};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sink::{
    DeliverySink, IngestRequest, KeywordRecommendation, QueueTelemetry, SinkError,
};
pub use self::store::{KvStore, StoreError};
