//! Operation - 状態ストリームと完了 Future をひとまとめにしたハンドル
//!
//! enqueue / cancel / prune など、バックグラウンドで実行される操作の結果を表します。
//! 内部エラーは `OperationState::Failure` として届き、呼び出し側へパニックとして漏れません。

use std::future::IntoFuture;
use std::pin::Pin;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    Success,
    Failure(String),
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation failed: {0}")]
pub struct OperationError(pub String);

/// Consumer side.
#[derive(Debug, Clone)]
pub struct Operation {
    state: watch::Receiver<OperationState>,
}

/// Producer side. Dropping it unresolved fails the operation.
#[derive(Debug)]
pub struct OperationCompleter {
    state: watch::Sender<OperationState>,
}

impl Operation {
    pub fn pending() -> (OperationCompleter, Operation) {
        let (state, rx) = watch::channel(OperationState::InProgress);
        (OperationCompleter { state }, Operation { state: rx })
    }

    pub fn completed() -> Operation {
        let (_, rx) = watch::channel(OperationState::Success);
        Operation { state: rx }
    }

    pub fn failed(message: impl Into<String>) -> Operation {
        let (_, rx) = watch::channel(OperationState::Failure(message.into()));
        Operation { state: rx }
    }

    pub fn state(&self) -> OperationState {
        self.state.borrow().clone()
    }

    /// Live state stream with last-value replay.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.state.clone()
    }

    pub async fn result(&self) -> Result<(), OperationError> {
        let mut state = self.state.clone();
        let terminal = state
            .wait_for(OperationState::is_terminal)
            .await
            .map(|terminal| terminal.clone());
        let outcome = match terminal {
            Ok(terminal) => terminal,
            // The completer is gone; its Drop already published a terminal state.
            Err(_) => state.borrow().clone(),
        };
        match outcome {
            OperationState::Success => Ok(()),
            OperationState::Failure(message) => Err(OperationError(message)),
            OperationState::InProgress => Err(OperationError("operation abandoned".into())),
        }
    }
}

impl IntoFuture for Operation {
    type Output = Result<(), OperationError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

impl OperationCompleter {
    pub fn succeed(self) {
        self.state.send_replace(OperationState::Success);
    }

    pub fn fail(self, message: impl Into<String>) {
        self.state
            .send_replace(OperationState::Failure(message.into()));
    }

    pub fn finish<E: std::fmt::Display>(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.succeed(),
            Err(err) => self.fail(err.to_string()),
        }
    }
}

impl Drop for OperationCompleter {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == OperationState::InProgress {
                *state = OperationState::Failure("operation dropped before completing".into());
                true
            } else {
                false
            }
        });
    }
}
