//! gleaner-core
//!
//! Crawl orchestration core: a persisted keyword backlog, one resumable Run
//! at a time against a browsing executor, and best-effort delivery of results.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, category, item, run, decision, errors）
//! - **ports**: 抽象化レイヤー（KvStore, BrowsingExecutor, DeliverySink, Clock, IdGenerator）
//! - **queue**: backlog（TaskRecord, 依存グラフ, 優先度, リトライ）
//! - **monitor**: セッション健全性の判定とスロットル
//! - **run**: Run ステートマシンの 1 ステップ
//! - **delivery**: 配送バッファとテレメトリの間引き
//! - **app**: Scheduler, driver, tick loop, コマンド, builder
//! - **impls**: ports の実装（JSON ファイルストア, HTTP sink, fixture executor）
//! - **config**: 設定の読み込み

pub mod app;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod impls;
pub mod monitor;
pub mod ports;
pub mod queue;
pub mod run;

#[cfg(test)]
mod testing;
