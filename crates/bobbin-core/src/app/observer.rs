//! ステータスストリーム
//!
//! コミットのたびにクエリを再実行し、値が変わったときだけ配信します。
//! 受信側がすべて drop されるとタスクは終了します。

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::store::{Transaction, WorkDatabase};

pub(crate) fn observe<T, F>(db: Arc<WorkDatabase>, runtime: &Handle, query: F) -> watch::Receiver<T>
where
    T: PartialEq + Send + Sync + 'static,
    F: Fn(&Transaction<'_>) -> T + Send + 'static,
{
    // Subscribe before the first read so no commit slips in between.
    let mut changes = db.subscribe();
    let (tx, rx) = watch::channel(db.read(&query));
    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = db.read(&query);
                    tx.send_if_modified(|current| {
                        if *current == latest {
                            false
                        } else {
                            *current = latest;
                            true
                        }
                    });
                }
            }
        }
    });
    rx
}
