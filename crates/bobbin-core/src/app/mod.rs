//! App - アプリケーション層
//!
//! このモジュールは、ports・store・handler を組み合わせてエンジン本体を実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング
//! - **WorkEngine**: 投入・キャンセル・問い合わせの表面
//! - **WorkContinuation**: enqueue 前のジョブ DAG
//! - **Processor / WorkRunner**: 実行の管理と 1 回の試行
//! - **transitions**: 状態遷移と依存先への伝播
//! - **BackgroundExecutor**: ストア書き込みの直列化
//! - **recovery**: 起動時リカバリ

pub mod builder;
pub mod config;
pub mod continuation;
pub mod engine;
pub mod executor;
pub mod operation;
pub mod processor;
pub mod progress;
pub mod recovery;
pub mod schedulers;

pub(crate) mod engine_core;
pub(crate) mod observer;
pub(crate) mod runner;
pub(crate) mod transitions;

#[cfg(test)]
mod scenarios;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::config::{ConfigError, Configuration};
pub use self::continuation::WorkContinuation;
pub use self::engine::WorkEngine;
pub use self::executor::BackgroundExecutor;
pub use self::operation::{Operation, OperationCompleter, OperationError, OperationState};
pub use self::processor::{ExecutionListener, Processor};
pub use self::progress::ProgressTracker;
pub use self::recovery::RecoveryReport;
pub use self::schedulers::Schedulers;
