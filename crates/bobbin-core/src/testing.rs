//! テスト用ドライバ
//!
//! バックエンドを介さずに、任意のジョブを「今すぐ」1 回実行します。
//! バックオフ中・遅延中・周期待ちのジョブも期限を無視して走らせられるので、
//! `FixedClock` と組み合わせて時間に依存するシナリオを決定的に書けます。
//!
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .register::<Flaky>()?
//!     .without_default_schedulers()
//!     .build()?;
//! let driver = TestDriver::new(&engine);
//! engine.enqueue(vec![request])?.await?;
//! driver.run_now(id).await;
//! ```
//!
//! ハンドラ単体のテストには `WorkContextBuilder` で `WorkContext` を直接作れます。
//!
//! ```ignore
//! let (ctx, controls) = WorkContextBuilder::new()
//!     .input(Data::empty().with("name", "bobbin"))
//!     .build();
//! let result = Greet.do_work(ctx).await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::app::WorkEngine;
use crate::app::runner::WorkRunner;
use crate::domain::{Data, EngineError, WorkId, WorkState, WorkStatus};
use crate::handler::WorkContext;

pub struct TestDriver {
    engine: WorkEngine,
}

impl TestDriver {
    pub fn new(engine: &WorkEngine) -> Self {
        Self {
            engine: engine.clone(),
        }
    }

    /// Runs one attempt of `id` regardless of its due time. Unmet constraints still hold it back.
    /// Resolves to whether the record still needs rescheduling afterwards.
    pub async fn run_now(&self, id: WorkId) -> bool {
        let (_interrupt, interrupted) = watch::channel(false);
        WorkRunner::new(Arc::clone(self.engine.core()), id, interrupted)
            .ignoring_schedule()
            .run()
            .await
    }

    /// Runs a schedule pass behind everything already queued on the executor.
    pub async fn schedule_pass(&self) -> Result<usize, EngineError> {
        let core = Arc::clone(self.engine.core());
        self.engine
            .core()
            .executor
            .run(move || core.schedule_pass())
            .await?
            .map_err(EngineError::from)
    }

    /// Number of attempts the engine's own processor is running right now.
    pub fn running_count(&self) -> usize {
        self.engine.processor().running_count()
    }
}

/// Waits until `id` reaches `state`, or `timeout` passes.
pub async fn wait_for_state(
    engine: &WorkEngine,
    id: WorkId,
    state: WorkState,
    timeout: Duration,
) -> Option<WorkStatus> {
    let mut statuses = engine.observe_status_by_id(id);
    let reached = tokio::time::timeout(
        timeout,
        statuses.wait_for(|status| status.as_ref().is_some_and(|status| status.state == state)),
    )
    .await;
    match reached {
        Ok(Ok(status)) => status.clone(),
        _ => None,
    }
}

// ========================================
// ハンドラ単体テスト用
// ========================================

/// Builds a `WorkContext` outside an engine, for unit-testing handlers.
#[derive(Debug, Clone)]
pub struct WorkContextBuilder {
    id: WorkId,
    input: Data,
    tags: BTreeSet<String>,
    run_attempt_count: u32,
}

impl Default for WorkContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkContextBuilder {
    pub fn new() -> Self {
        Self {
            id: WorkId::generate(),
            input: Data::empty(),
            tags: BTreeSet::new(),
            run_attempt_count: 0,
        }
    }

    pub fn id(mut self, id: WorkId) -> Self {
        self.id = id;
        self
    }

    pub fn input(mut self, input: Data) -> Self {
        self.input = input;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Attempts made before the one under test.
    pub fn run_attempt_count(mut self, count: u32) -> Self {
        self.run_attempt_count = count;
        self
    }

    /// The context plus the engine-side ends of its stop and progress channels.
    pub fn build(self) -> (WorkContext, ContextControls) {
        let (stop, stopped) = watch::channel(false);
        let progress = Arc::new(watch::channel(Data::empty()).0);
        let ctx = WorkContext::new(
            self.id,
            self.input,
            self.tags,
            self.run_attempt_count,
            stopped,
            Some(Arc::clone(&progress)),
        );
        (ctx, ContextControls { stop, progress })
    }
}

/// What the engine would hold while a handler runs.
pub struct ContextControls {
    stop: watch::Sender<bool>,
    progress: Arc<watch::Sender<Data>>,
}

impl ContextControls {
    /// Asks the handler to stop, as cancellation or shutdown would.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// The last progress the handler reported.
    pub fn progress(&self) -> Data {
        self.progress.borrow().clone()
    }

    pub fn observe_progress(&self) -> watch::Receiver<Data> {
        self.progress.subscribe()
    }
}
