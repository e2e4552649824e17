//! bobbin-core
//!
//! Core building blocks for the Bobbin work engine: durable, dependency-aware background jobs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, request, record, state, status, data, policy, outcome, errors）
//! - **ports**: 抽象化レイヤー（Clock, Scheduler, WorkLauncher, SnapshotStore）
//! - **store**: WorkDatabase（トランザクション付きのレコード表と依存インデックス）
//! - **handler**: プラグイン（WorkHandler, InputMerger とそのレジストリ）
//! - **app**: アプリケーションロジック（builder, engine, continuation, processor, runner, recovery など）
//! - **impls**: 実装（GreedyScheduler, DelayedScheduler, スナップショット保存先）
//! - **testing**: テスト用ドライバ

pub mod app;
pub mod domain;
pub mod handler;
pub mod impls;
pub mod ports;
pub mod store;
pub mod testing;

pub use app::{
    BuildError, Configuration, EngineBuilder, Operation, OperationError, OperationState,
    RecoveryReport, WorkContinuation, WorkEngine,
};
pub use domain::{
    BackoffPolicy, Data, EngineError, ExistingPeriodicWorkPolicy, ExistingWorkPolicy, WorkId,
    WorkRequest, WorkResult, WorkState, WorkStatus,
};
pub use handler::{HandlerError, InputMerger, NamedHandler, WorkContext, WorkHandler};
