//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait はストレージ（in-memory / SQLite）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - Broker が source of truth（正本）
//! - worker と scheduler は lease 中の一時的なビューしか持たない

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod schedule_store;
pub mod status;

pub use self::broker::Broker;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::schedule_store::ScheduleStore;
pub use self::status::{JobFilter, QueueStats, StatusView, WorkerHeartbeat};
