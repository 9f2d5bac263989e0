//! shuttle-core
//!
//! Broker-backed asynchronous job execution: durable queue, scheduler and
//! worker pool with retry, timeout, lease and failure isolation.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, schedule, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（Broker, ScheduleStore, StatusView, Clock, IdGenerator）
//! - **impls**: 実装（MemoryBroker, SqliteBroker）
//! - **typed**: 型付き Job API（JobKind, Handler, TypedRegistry, PayloadCodec）
//! - **app**: アプリケーションロジック（worker pool, scheduler, reaper, gateway, status）
//! - **config**: デプロイ設定（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;
