//! BackgroundExecutor - ストアを書き換える処理を 1 本のスレッドで直列に実行する
//!
//! # 設計原則
//! - 状態遷移はすべてここを通るので、同じジョブに対する遷移は互いに追い越さない
//! - ジョブ内のパニックは捕まえてログに残し、スレッドは生かしたままにする
//! - `run()` は結果を oneshot で返す（ジョブがパニックした場合は `Err` として届く）

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::domain::EngineError;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct BackgroundExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl BackgroundExecutor {
    pub fn spawn() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("bobbin-background".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        error!(panic = panic_message(&panic), "background job panicked");
                    }
                }
                debug!("background executor stopped");
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Queues `job` behind everything submitted before it.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), EngineError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(EngineError::ExecutorClosed)?;
        sender
            .send(Box::new(job))
            .map_err(|_| EngineError::ExecutorClosed)
    }

    /// Queues `job` and resolves with its return value.
    pub fn run<R, F>(&self, job: F) -> impl Future<Output = Result<R, EngineError>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.execute(move || {
            let _ = tx.send(job());
        });
        async move {
            queued?;
            rx.await.map_err(|_| EngineError::ExecutorClosed)
        }
    }

    /// Lets the thread drain what is queued, then exit.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
