//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 循環参照を Weak で断ち切るワイヤリング（Processor ← バックエンド）

use std::sync::{Arc, Weak};

use tokio::runtime::Handle;

use super::config::{ConfigError, Configuration};
use super::engine::WorkEngine;
use super::engine_core::EngineCore;
use super::executor::BackgroundExecutor;
use super::processor::Processor;
use super::schedulers::Schedulers;
use crate::domain::{EngineError, StoreError};
use crate::handler::{
    HandlerRegistry, InputMerger, MergerRegistry, NamedHandler, RegistryError, WorkHandler,
};
use crate::impls::{
    DelayedScheduler, GreedyScheduler, InMemoryConstraintTracker, JsonFileSnapshotStore,
};
use crate::ports::{
    Clock, ConstraintTracker, Scheduler, SnapshotStore, SystemClock, WorkLauncher,
};
use crate::store::WorkDatabase;

type SchedulerFactory =
    Box<dyn FnOnce(Weak<dyn WorkLauncher>, Arc<dyn Clock>) -> Arc<dyn Scheduler> + Send>;

/// EngineBuilder は WorkEngine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .register::<Upload>()?
///     .expect_handlers(&["upload"])
///     .configuration(Configuration::from_json_file("bobbin.json")?)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_handlers() で期待されるハンドラ名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
/// - tokio ランタイムの外で build() すると BuildError::NoRuntime
pub struct EngineBuilder {
    handlers: HandlerRegistry,
    mergers: MergerRegistry,
    expected_handlers: Option<Vec<String>>,
    config: Configuration,
    clock: Arc<dyn Clock>,
    constraints: Arc<dyn ConstraintTracker>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    default_schedulers: bool,
    schedulers: Vec<SchedulerFactory>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("the work engine must be built inside a tokio runtime")]
    NoRuntime,

    #[error("cannot open the work store: {0}")]
    Store(#[from] StoreError),

    #[error("cannot start the background executor: {0}")]
    Executor(#[source] std::io::Error),

    #[error("cannot start the engine: {0}")]
    Start(#[from] EngineError),
}

impl EngineBuilder {
    /// 新しい EngineBuilder を作成
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::new(),
            mergers: MergerRegistry::with_defaults(),
            expected_handlers: None,
            config: Configuration::default(),
            clock: Arc::new(SystemClock),
            constraints: Arc::new(InMemoryConstraintTracker::new()),
            snapshots: None,
            default_schedulers: true,
            schedulers: Vec::new(),
        }
    }

    /// ハンドラを名前で登録（試行ごとに `factory` が呼ばれる）
    pub fn register_handler<F>(mut self, name: impl Into<String>, factory: F) -> Result<Self, BuildError>
    where
        F: Fn() -> Box<dyn WorkHandler> + Send + Sync + 'static,
    {
        self.handlers.register(name, factory)?;
        Ok(self)
    }

    /// `NamedHandler::NAME` で登録
    ///
    /// # Example
    /// ```ignore
    /// builder.register::<Upload>()?;
    /// ```
    pub fn register<H: NamedHandler>(mut self) -> Result<Self, BuildError> {
        self.handlers.register_named::<H>()?;
        Ok(self)
    }

    pub fn register_merger(
        mut self,
        name: impl Into<String>,
        merger: impl InputMerger + 'static,
    ) -> Result<Self, BuildError> {
        self.mergers.register(name, merger)?;
        Ok(self)
    }

    /// 期待されるハンドラ名のリストを設定
    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected_handlers = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Source of truth for the conditions named by `WorkRequestBuilder::require`.
    /// Defaults to an empty `InMemoryConstraintTracker`, where nothing is met.
    pub fn constraint_tracker(mut self, tracker: Arc<dyn ConstraintTracker>) -> Self {
        self.constraints = tracker;
        self
    }

    /// Overrides `Configuration::snapshot_path`.
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Skips the greedy and delayed backends. Work then only runs through `with_scheduler`
    /// backends or a `TestDriver`.
    pub fn without_default_schedulers(mut self) -> Self {
        self.default_schedulers = false;
        self
    }

    /// Adds a backend. `factory` receives the processor as its launcher.
    pub fn with_scheduler<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(Weak<dyn WorkLauncher>, Arc<dyn Clock>) -> Arc<dyn Scheduler> + Send + 'static,
    {
        self.schedulers.push(Box::new(factory));
        self
    }

    /// EngineBuilder を構築して WorkEngine を起動
    ///
    /// # 検証
    /// - expect_handlers() で設定されたハンドラが全て登録されているかチェック
    /// - Configuration::validate()
    ///
    /// 起動直後にリカバリが実行されます（`WorkEngine::recovery()` で待てる）。
    pub fn build(self) -> Result<WorkEngine, BuildError> {
        if let Some(expected) = &self.expected_handlers {
            let registered = self.handlers.registered_names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let snapshots = self.snapshots.or_else(|| {
            self.config
                .snapshot_path
                .clone()
                .map(|path| Arc::new(JsonFileSnapshotStore::new(path)) as Arc<dyn SnapshotStore>)
        });
        let db = match snapshots {
            Some(snapshots) => WorkDatabase::open(snapshots)?,
            None => WorkDatabase::in_memory(),
        };
        let executor = BackgroundExecutor::spawn().map_err(BuildError::Executor)?;

        let clock = self.clock;
        let core = Arc::new(EngineCore::new(
            Arc::new(db),
            executor,
            self.handlers,
            self.mergers,
            self.config,
            Arc::clone(&clock),
            Arc::clone(&self.constraints),
            runtime,
        ));
        let processor = Processor::new(Arc::clone(&core));
        let launcher: Arc<dyn WorkLauncher> = processor.clone();
        let launcher = Arc::downgrade(&launcher);

        let mut backends: Vec<Arc<dyn Scheduler>> = Vec::new();
        if self.default_schedulers {
            backends.push(Arc::new(GreedyScheduler::spawn(
                launcher.clone(),
                Arc::clone(&clock),
                self.constraints,
                &core.runtime,
            )));
            backends.push(Arc::new(DelayedScheduler::spawn(
                launcher.clone(),
                Arc::clone(&clock),
                core.config.max_scheduler_limit,
                &core.runtime,
            )));
        }
        for factory in self.schedulers {
            backends.push(factory(launcher.clone(), Arc::clone(&clock)));
        }
        // Nothing has read the cell yet, so this always lands.
        let _ = core.schedulers.set(Schedulers::new(backends));

        Ok(WorkEngine::start(core, processor)?)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
