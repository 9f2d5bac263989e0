//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: handler の登録と起動時検証
//! - **WorkerPool**: ジョブ実行ループ（lease→handle→report）
//! - **Scheduler**: スケジュールの発火
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **Gateway**: enqueue の受け口
//! - **StatusReport**: 観測用スナップショット

pub mod builder;
pub mod gateway;
pub mod reaper_loop;
pub mod scheduler;
pub mod status;
pub mod worker_pool;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::gateway::{Gateway, GatewayError};
pub use self::reaper_loop::ReaperLoop;
pub use self::scheduler::{Scheduler, TickReport};
pub use self::status::{LeaseStatus, StatusReport, WorkerStatus};
pub use self::worker_pool::{WorkerPool, WorkerSettings};
