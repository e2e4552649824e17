//! WorkRunner - 1 回の実行試行を最初から最後まで担当する
//!
//! # フロー
//! 1. レコードと前提ジョブの出力を読む（存在しない / ENQUEUED でない / 期限前 / 実行条件が未成立なら何もしない）
//! 2. InputMerger で入力をまとめる（周期ジョブは自分の入力のみ）
//! 3. ENQUEUED → RUNNING をトランザクションで確定（負けたら何もしない）
//! 4. ハンドラを別タスクで実行し、割り込みと競争させる
//! 5. 結果を遷移に写像し、バックエンドへキャンセル通知、再スケジュールパス
//!
//! 割り込まれた後は状態遷移を一切行わず、ストアの現在値から再スケジュール要否だけを返します。
//! 例外は実行条件が崩れて止められた場合で、この試行は RETRY として記録されます。
//! 試行ごとに新しい WorkRunner を作り、使い回しません。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::engine_core::EngineCore;
use super::executor::panic_message;
use super::transitions::{self, Applied};
use crate::domain::{
    Constraints, Data, EngineError, MAX_DATA_BYTES, StoreError, WorkId, WorkRecord, WorkResult,
    WorkState,
};
use crate::handler::{HandlerError, WorkContext};

enum Merge {
    Merged(Data),
    Failed(Data),
    Interrupted,
}

pub(crate) struct WorkRunner {
    core: Arc<EngineCore>,
    id: WorkId,
    interrupt: watch::Receiver<bool>,
    respect_schedule: bool,
}

impl WorkRunner {
    pub(crate) fn new(core: Arc<EngineCore>, id: WorkId, interrupt: watch::Receiver<bool>) -> Self {
        Self {
            core,
            id,
            interrupt,
            respect_schedule: true,
        }
    }

    /// Runs the record even when it is not due yet.
    pub(crate) fn ignoring_schedule(mut self) -> Self {
        self.respect_schedule = false;
        self
    }

    fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Resolves to whether the record still needs rescheduling.
    pub(crate) async fn run(mut self) -> bool {
        let id = self.id;
        let loaded = self.core.db.read(|tx| {
            tx.get(id)
                .cloned()
                .map(|record| (record, tx.prerequisite_outputs(id)))
        });
        if self.is_interrupted() {
            return self.resolve_interrupted();
        }
        let Some((record, upstream)) = loaded else {
            debug!(%id, "trigger for unknown work ignored");
            return false;
        };
        if record.state != WorkState::Enqueued {
            debug!(%id, state = %record.state, "work is not enqueued, trigger ignored");
            return record.state == WorkState::Running;
        }
        if self.respect_schedule && record.next_run_time() > self.core.now() {
            debug!(%id, due = %record.next_run_time(), "trigger arrived before the work is due");
            return false;
        }
        if !self.core.constraints_met(&record.constraints) {
            debug!(%id, "constraints not met, trigger ignored");
            return false;
        }

        let input = if record.is_periodic() {
            record.input.clone()
        } else {
            match self.merge_input(&record, upstream).await {
                Merge::Merged(input) => input,
                Merge::Failed(diagnostic) => return self.fail_before_start(diagnostic).await,
                Merge::Interrupted => return self.resolve_interrupted(),
            }
        };

        let Some(handler) = self.core.handlers.create(&record.handler) else {
            error!(%id, handler = %record.handler, "no handler registered under this name");
            let diagnostic =
                Data::diagnostic(format!("handler '{}' is not registered", record.handler));
            return self.fail_before_start(diagnostic).await;
        };

        let core = Arc::clone(&self.core);
        let started = self
            .core
            .executor
            .run(move || {
                core.db.transaction(|tx| {
                    let started = transitions::try_set_running(tx, id);
                    Ok::<_, StoreError>((started, tx.state(id)))
                })
            })
            .await
            .and_then(|result| result.map_err(EngineError::from));
        let (started, state) = match started {
            Ok(started) => started,
            Err(err) => {
                error!(%id, error = %err, "could not mark work as running");
                return false;
            }
        };
        if !started {
            debug!(%id, state = ?state, "another attempt got there first");
            return state == Some(WorkState::Running);
        }
        if self.is_interrupted() {
            return self.interrupted_attempt(&record.constraints).await;
        }

        let progress = self.core.progress.start_tracking(id);
        let ctx = WorkContext::new(
            id,
            input,
            record.tags.clone(),
            record.run_attempt_count,
            self.interrupt.clone(),
            Some(progress),
        );
        info!(%id, handler = %record.handler, attempt = record.run_attempt_count + 1, "work started");

        let mut task = self
            .core
            .runtime
            .spawn(async move { handler.do_work(ctx).await });
        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = interrupted(&mut self.interrupt) => None,
        };
        let Some(joined) = joined else {
            let grace = self.core.config.stop_grace_period();
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(%id, ?grace, "handler ignored the stop request, aborting it");
                task.abort();
            }
            return self.interrupted_attempt(&record.constraints).await;
        };
        let result = self.result_of(joined);
        self.on_work_finished(result, &record.constraints).await
    }

    async fn merge_input(&mut self, record: &WorkRecord, upstream: Vec<Data>) -> Merge {
        let Some(merger) = self.core.mergers.get(&record.input_merger) else {
            error!(id = %self.id, merger = %record.input_merger, "input merger is not registered");
            return Merge::Failed(Data::diagnostic(format!(
                "input merger '{}' is not registered",
                record.input_merger
            )));
        };
        let mut inputs = Vec::with_capacity(upstream.len() + 1);
        inputs.push(record.input.clone());
        inputs.extend(upstream);

        let merging = tokio::task::spawn_blocking(move || merger.merge(&inputs));
        tokio::select! {
            merged = merging => match merged {
                Ok(input) => Merge::Merged(input),
                Err(err) => {
                    error!(id = %self.id, error = %err, "input merger panicked");
                    Merge::Failed(Data::diagnostic("input merger panicked"))
                }
            },
            _ = interrupted(&mut self.interrupt) => Merge::Interrupted,
        }
    }

    fn result_of(&self, joined: Result<Result<WorkResult, HandlerError>, JoinError>) -> WorkResult {
        let id = self.id;
        match joined {
            Ok(Ok(result)) => match result.output() {
                Some(output) if output.exceeds_limit() => {
                    let size = output.size_in_bytes();
                    warn!(%id, size, limit = MAX_DATA_BYTES, "handler output is too large");
                    WorkResult::failure_with(Data::diagnostic(format!(
                        "output is {size} bytes, over the {MAX_DATA_BYTES} byte limit"
                    )))
                }
                _ => result,
            },
            Ok(Err(err)) => {
                error!(%id, error = %err, "handler returned an error");
                WorkResult::failure()
            }
            Err(err) if err.is_panic() => {
                let panic = err.into_panic();
                error!(%id, panic = panic_message(&*panic), "handler panicked");
                WorkResult::failure()
            }
            Err(err) => {
                error!(%id, error = %err, "handler task was cancelled");
                WorkResult::failure()
            }
        }
    }

    async fn on_work_finished(&self, result: WorkResult, constraints: &Constraints) -> bool {
        let id = self.id;
        if self.is_interrupted() {
            return self.interrupted_attempt(constraints).await;
        }
        let kind = result.kind();
        let core = Arc::clone(&self.core);
        let applied = self
            .core
            .executor
            .run(move || {
                let now = core.now();
                let applied = core.db.transaction(|tx| {
                    let applied = match tx.state(id) {
                        None => Applied {
                            needs_reschedule: false,
                            finished: true,
                        },
                        Some(WorkState::Running) => transitions::apply_result(tx, id, result, now),
                        Some(state) if !state.is_finished() => {
                            transitions::retry(tx, id, now);
                            Applied {
                                needs_reschedule: true,
                                finished: false,
                            }
                        }
                        Some(_) => Applied {
                            needs_reschedule: false,
                            finished: true,
                        },
                    };
                    Ok::<_, StoreError>(applied)
                })?;
                // Retries and periodic resets leave old triggers behind too.
                core.schedulers().cancel(id);
                core.schedule_pass_logged();
                Ok::<_, StoreError>(applied)
            })
            .await
            .and_then(|result| result.map_err(EngineError::from));
        self.core.progress.stop_tracking(id);

        match applied {
            Ok(applied) => {
                info!(%id, outcome = ?kind, finished = applied.finished, "work attempt done");
                applied.needs_reschedule
            }
            Err(err) => {
                // The record is still RUNNING; the reschedule path puts it back.
                error!(%id, error = %err, "could not record the work result");
                true
            }
        }
    }

    /// Configuration errors fail the record and its dependents without running anything.
    async fn fail_before_start(&self, diagnostic: Data) -> bool {
        let id = self.id;
        let core = Arc::clone(&self.core);
        let failed = self
            .core
            .executor
            .run(move || {
                let failed = core.db.transaction(|tx| {
                    let failed = if tx.state(id) == Some(WorkState::Enqueued) {
                        transitions::fail_with_dependents(tx, id, Some(diagnostic))
                    } else {
                        Vec::new()
                    };
                    Ok::<_, StoreError>(failed)
                })?;
                for id in &failed {
                    core.schedulers().cancel(*id);
                }
                core.schedule_pass_logged();
                Ok::<_, StoreError>(failed.len())
            })
            .await
            .and_then(|result| result.map_err(EngineError::from));
        match failed {
            Ok(count) => warn!(%id, failed = count, "work failed before it could start"),
            Err(err) => error!(%id, error = %err, "could not fail misconfigured work"),
        }
        false
    }

    /// An attempt that was RUNNING when the stop arrived.
    async fn interrupted_attempt(&self, constraints: &Constraints) -> bool {
        self.core.progress.stop_tracking(self.id);
        if !self.core.is_shut_down() && !self.core.constraints_met(constraints) {
            return self.retry_for_constraints().await;
        }
        self.resolve_interrupted()
    }

    /// Lost constraints count as RETRY: the attempt is used up and backoff applies.
    async fn retry_for_constraints(&self) -> bool {
        let id = self.id;
        let core = Arc::clone(&self.core);
        let retried = self
            .core
            .executor
            .run(move || {
                let now = core.now();
                let retried = core.db.transaction(|tx| {
                    let retried = tx.state(id) == Some(WorkState::Running)
                        && transitions::retry(tx, id, now);
                    Ok::<_, StoreError>(retried)
                })?;
                core.schedulers().cancel(id);
                core.schedule_pass_logged();
                Ok::<_, StoreError>(retried)
            })
            .await
            .and_then(|result| result.map_err(EngineError::from));
        match retried {
            Ok(true) => {
                info!(%id, "constraints no longer met, work will retry");
                false
            }
            Ok(false) => self.resolve_interrupted(),
            Err(err) => {
                error!(%id, error = %err, "could not requeue work that lost its constraints");
                true
            }
        }
    }

    /// The store's current state decides; the in-memory result is discarded.
    fn resolve_interrupted(&self) -> bool {
        let state = self.core.db.read(|tx| tx.state(self.id));
        debug!(id = %self.id, state = ?state, "work interrupted");
        state.is_some_and(|state| !state.is_finished())
    }
}

async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    // A dropped sender never interrupts.
    if interrupt.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
