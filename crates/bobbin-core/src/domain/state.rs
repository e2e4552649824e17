//! State - WorkRecord の状態
//!
//! # 状態遷移
//! - enqueued: 実行可能（前提ジョブはすべて成功済み）
//! - running: 実行中（1 ID につき同時に 1 つだけ）
//! - succeeded / failed / cancelled: 終端
//! - blocked: 前提ジョブの完了待ち
//!
//! 周期ジョブは終端に到達せず、各周期の終わりに enqueued へ戻ります。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Cancelled,
}

impl WorkState {
    /// 終端状態かどうか（succeeded / failed / cancelled）
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkState::Enqueued => "ENQUEUED",
            WorkState::Running => "RUNNING",
            WorkState::Succeeded => "SUCCEEDED",
            WorkState::Failed => "FAILED",
            WorkState::Blocked => "BLOCKED",
            WorkState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
