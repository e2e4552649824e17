//! Errors - エンジンとストアのエラー型
//!
//! # 分類
//! - 呼び出し側の誤用（空のリスト、巨大な入力など）: 同期的に `Err` を返す
//! - ストア／実行基盤のエラー: `Operation` の失敗として通知される
//! - ジョブ自身の失敗: エラーではなく FAILED 状態として観測される

use thiserror::Error;

use super::ids::WorkId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} needs at least one work request")]
    EmptyWork(&'static str),

    #[error("invalid work request: {0}")]
    InvalidRequest(String),

    #[error("input of {id} is {size} bytes, over the {limit} byte limit")]
    DataTooLarge { id: WorkId, size: usize, limit: usize },

    #[error("prerequisite {0} does not exist")]
    UnknownPrerequisite(WorkId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("background executor is no longer running")]
    ExecutorClosed,

    #[error("engine is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work {0} already exists")]
    DuplicateId(WorkId),

    #[error("dependency cycle detected: {0:?}")]
    Cycle(Vec<WorkId>),

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
