//! WorkStatus - 問い合わせ用の読み取りスナップショット

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::data::Data;
use super::ids::WorkId;
use super::state::WorkState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    pub id: WorkId,
    pub state: WorkState,
    pub output: Data,
    pub tags: BTreeSet<String>,
    pub run_attempt_count: u32,
    pub period_count: u32,
}

impl WorkStatus {
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}
