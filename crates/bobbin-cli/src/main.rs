use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bobbin_core::impls::{InMemoryConstraintTracker, JsonFileSnapshotStore};
use bobbin_core::ports::{FixedClock, SnapshotStore};
use bobbin_core::{
    Configuration, Data, EngineBuilder, ExistingWorkPolicy, HandlerError, NamedHandler,
    WorkContext, WorkEngine, WorkHandler, WorkId, WorkRequest, WorkResult, WorkState, WorkStatus,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bobbin", about = "Durable, dependency-aware background work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a showcase workload and print the final statuses as JSON.
    Demo {
        /// Engine configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Persist records to this JSON file.
        #[arg(long)]
        store: Option<PathBuf>,
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// List the records persisted in a store file.
    Inspect {
        #[arg(long)]
        store: PathBuf,
    },
    /// Run startup recovery on a store file and print the report.
    Recover {
        #[arg(long)]
        store: PathBuf,
    },
}

// ========================================
// デモ用ハンドラ
// ========================================

/// greet: 入力の name から挨拶文を作る
#[derive(Default)]
struct Greet;

#[async_trait]
impl WorkHandler for Greet {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        let name = ctx.input().get_str("name").ok_or("missing name")?;
        Ok(WorkResult::success_with(
            Data::empty().with("greeting", format!("Hello, {name}!")),
        ))
    }
}

impl NamedHandler for Greet {
    const NAME: &'static str = "greet";
}

/// shout: 前段の greeting（マージ済み入力）を大文字にする
#[derive(Default)]
struct Shout;

#[async_trait]
impl WorkHandler for Shout {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        let greeting = ctx.input().get_str("greeting").ok_or("missing greeting")?;
        Ok(WorkResult::success_with(
            Data::empty().with("shouted", greeting.to_uppercase()),
        ))
    }
}

impl NamedHandler for Shout {
    const NAME: &'static str = "shout";
}

/// flaky: 2 回 RETRY してから成功する
#[derive(Default)]
struct Flaky;

#[async_trait]
impl WorkHandler for Flaky {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        if ctx.run_attempt_count() < 2 {
            info!(attempt = ctx.run_attempt_count() + 1, "flaky work asks for a retry");
            return Ok(WorkResult::retry());
        }
        Ok(WorkResult::success_with(
            Data::empty().with("attempts", ctx.run_attempt_count() + 1),
        ))
    }
}

impl NamedHandler for Flaky {
    const NAME: &'static str = "flaky";
}

/// broken: 常に失敗する（依存先も FAILED になる）
#[derive(Default)]
struct Broken;

#[async_trait]
impl WorkHandler for Broken {
    async fn do_work(&self, _ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        Ok(WorkResult::failure_with(
            Data::empty().with("reason", "the printer is on fire"),
        ))
    }
}

impl NamedHandler for Broken {
    const NAME: &'static str = "broken";
}

/// report: 何もせず成功する
#[derive(Default)]
struct Report;

#[async_trait]
impl WorkHandler for Report {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        ctx.set_progress(Data::empty().with("percent", 100));
        Ok(WorkResult::success())
    }
}

impl NamedHandler for Report {
    const NAME: &'static str = "report";
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    statuses: Vec<WorkStatus>,
    unique_report: Vec<WorkStatus>,
    remaining_after_prune: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bobbin=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            config,
            store,
            timeout_secs,
        } => demo(config, store, Duration::from_secs(timeout_secs)).await,
        Command::Inspect { store } => inspect(store),
        Command::Recover { store } => recover(store).await,
    }
}

async fn demo(config: Option<PathBuf>, store: Option<PathBuf>, timeout: Duration) -> Result<()> {
    // (A) 設定を読む（ファイルがなければ既定値）
    let mut configuration = match config {
        Some(path) => Configuration::from_json_file(&path)?,
        None => Configuration::default(),
    };
    if store.is_some() {
        configuration.snapshot_path = store;
    }

    // (B) エンジンを構築（バックオフを早送りできるよう時計は手動）
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let conditions = Arc::new(InMemoryConstraintTracker::new());
    let engine = EngineBuilder::new()
        .register::<Greet>()?
        .register::<Shout>()?
        .register::<Flaky>()?
        .register::<Broken>()?
        .register::<Report>()?
        .expect_handlers(&[Greet::NAME, Shout::NAME, Flaky::NAME, Broken::NAME, Report::NAME])
        .configuration(configuration)
        .clock(clock.clone())
        .constraint_tracker(conditions.clone())
        .build()?;
    engine.recovery().await?;

    // (C) ジョブ投入
    let greet = WorkRequest::one_time(Greet::NAME)
        .input(Data::empty().with("name", "bobbin"))
        .tag("demo")
        .build();
    let shout = WorkRequest::one_time(Shout::NAME).tag("demo").build();
    let flaky = WorkRequest::one_time(Flaky::NAME).tag("demo").build();
    let broken = WorkRequest::one_time(Broken::NAME).tag("demo").build();
    let after_broken = WorkRequest::one_time(Report::NAME).tag("demo").build();
    let on_network = WorkRequest::one_time(Report::NAME)
        .tag("demo")
        .require("network")
        .build();
    let mut ids = vec![
        greet.id(),
        shout.id(),
        flaky.id(),
        broken.id(),
        after_broken.id(),
        on_network.id(),
    ];

    engine
        .begin_with(vec![greet])?
        .then(vec![shout])?
        .enqueue()
        .await?;
    engine.enqueue(vec![flaky])?.await?;
    // network が来るまで待機し、来たら走る
    engine.enqueue(vec![on_network])?.await?;
    conditions.set("network", true);
    engine
        .begin_with(vec![broken])?
        .then(vec![after_broken])?
        .enqueue()
        .await?;

    // 2 回目の KEEP は、1 回目がまだ終わっていなければ何もしない
    for _ in 0..2 {
        let report = WorkRequest::one_time(Report::NAME).build();
        let chain = engine
            .begin_unique_work("nightly-report", ExistingWorkPolicy::Keep, vec![report])?
            .then(vec![WorkRequest::one_time(Report::NAME).build()])?;
        chain.enqueue().await?;
    }
    ids.extend(
        engine
            .statuses_for_unique_work("nightly-report")
            .into_iter()
            .map(|status| status.id),
    );

    // (D) 完了を待つ（RETRY 中のジョブは時計を進めて起こす）
    settle(&engine, &clock, &ids, timeout).await?;
    let statuses = engine.statuses_by_ids(&ids);
    let unique_report = engine.statuses_for_unique_work("nightly-report");

    // (E) 終わったジョブを片付けて停止
    engine.prune_work().await?;
    let remaining_after_prune = engine.statuses_by_ids(&ids).len();
    engine.shutdown().await;

    let summary = DemoSummary {
        statuses,
        unique_report,
        remaining_after_prune,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn settle(
    engine: &WorkEngine,
    clock: &FixedClock,
    ids: &[WorkId],
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let statuses = engine.statuses_by_ids(ids);
        if statuses.iter().all(WorkStatus::is_finished) {
            return Ok(());
        }
        let backed_off = statuses
            .iter()
            .any(|status| status.state == WorkState::Enqueued && status.run_attempt_count > 0);
        if backed_off {
            clock.advance(Duration::from_secs(60 * 60));
            engine.reschedule_eligible_work().await?;
        }
        if Instant::now() >= deadline {
            bail!("work did not finish within {timeout:?}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn inspect(store: PathBuf) -> Result<()> {
    let snapshots = JsonFileSnapshotStore::new(&store);
    let snapshot = snapshots
        .load()?
        .with_context(|| format!("{} holds no snapshot", store.display()))?;
    info!(
        records = snapshot.records.len(),
        dependencies = snapshot.dependencies.len(),
        running = snapshot.preferences.running,
        "snapshot loaded"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn recover(store: PathBuf) -> Result<()> {
    let engine = EngineBuilder::new()
        .snapshot_store(Arc::new(JsonFileSnapshotStore::new(&store)))
        .without_default_schedulers()
        .build()?;
    engine.recovery().await?;
    let report = engine
        .recovery_report()
        .context("recovery finished without a report")?;
    engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
