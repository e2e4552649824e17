//! WorkHandler trait - ジョブ本体のロジック
//!
//! # 使用例
//! ```ignore
//! #[derive(Default)]
//! struct Upload;
//!
//! #[async_trait]
//! impl WorkHandler for Upload {
//!     async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
//!         let path = ctx.input().get_str("path").ok_or("missing path")?;
//!         // ...
//!         Ok(WorkResult::success())
//!     }
//! }
//!
//! impl NamedHandler for Upload {
//!     const NAME: &'static str = "upload";
//! }
//! ```
//!
//! ハンドラは試行ごとに新しいインスタンスが作られます。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::{Data, WorkId, WorkResult};

#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Runs one attempt. `Err` is recorded as FAILURE with empty output.
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError>;
}

/// A handler with a fixed registration name, registrable with `EngineBuilder::register::<H>()`.
pub trait NamedHandler: WorkHandler + Default + 'static {
    const NAME: &'static str;
}

/// Error returned by handler logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("json: {err}"))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("io: {err}"))
    }
}

/// What a handler sees of the record it runs for.
pub struct WorkContext {
    id: WorkId,
    input: Data,
    tags: BTreeSet<String>,
    run_attempt_count: u32,
    stop: watch::Receiver<bool>,
    progress: Option<Arc<watch::Sender<Data>>>,
}

impl WorkContext {
    pub(crate) fn new(
        id: WorkId,
        input: Data,
        tags: BTreeSet<String>,
        run_attempt_count: u32,
        stop: watch::Receiver<bool>,
        progress: Option<Arc<watch::Sender<Data>>>,
    ) -> Self {
        Self {
            id,
            input,
            tags,
            run_attempt_count,
            stop,
            progress,
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    /// The record's own input merged with its prerequisites' outputs.
    pub fn input(&self) -> &Data {
        &self.input
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Attempts made before this one in the current period.
    pub fn run_attempt_count(&self) -> u32 {
        self.run_attempt_count
    }

    /// True once the engine asked this attempt to stop.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves when the engine asks this attempt to stop.
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        // A closed channel means the runner is gone, which is as good as a stop.
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    /// Best-effort progress report, visible through `WorkEngine::observe_progress`.
    pub fn set_progress(&self, progress: Data) {
        if let Some(sender) = &self.progress {
            sender.send_replace(progress);
        }
    }
}
