use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::StructuredError;
use crate::message::RequestId;
use crate::scheduler::{Scheduler, TokioScheduler};

/// Correlates outgoing requests with their eventual replies.
///
/// One table lives per connection. `allocate_id` hands out serials starting
/// at 1; `wait` registers a slot for that id, pushes the caller onto a
/// `oneshot`, and races the reply against a [`Scheduler`] timeout. Exactly one
/// of `deliver`, the timeout branch, or `drain_with_disconnect` ever resolves
/// a given id.
pub struct CallTable<Sch: Scheduler = TokioScheduler> {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, StructuredError>>>>,
    next_id: AtomicU64,
    scheduler: Sch,
}

impl<Sch: Scheduler> CallTable<Sch> {
    pub fn new(scheduler: Sch) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            scheduler,
        }
    }

    pub fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Deliver a reply to whichever caller is waiting on `id`. A no-op if the
    /// id is unknown (already timed out, already delivered, or never ours).
    pub fn deliver(&self, id: RequestId, outcome: Result<Value, StructuredError>) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve every outstanding call with a synthetic disconnect error, for
    /// connection close.
    pub fn drain_with_disconnect(&self) {
        let entries: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in entries {
            let _ = tx.send(Err(StructuredError::disconnected()));
        }
    }

    /// Register `id` and await its reply, or a synthetic timeout error if
    /// `timeout` elapses first.
    pub async fn wait(&self, id: RequestId, timeout: Duration) -> Result<Value, StructuredError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        match self.scheduler.timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StructuredError::disconnected()),
            Err(()) => {
                self.pending.lock().unwrap().remove(&id);
                Err(StructuredError::timeout())
            }
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deliver_resolves_wait() {
        let table = CallTable::new(TokioScheduler);
        let id = table.allocate_id();
        let table = std::sync::Arc::new(table);
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        table.deliver(id, Ok(json!("hi")));
        assert_eq!(waiter.await.unwrap().unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn timeout_produces_synthetic_error_and_clears_entry() {
        let table = CallTable::new(TokioScheduler);
        let id = table.allocate_id();
        let outcome = table.wait(id, Duration::from_millis(5)).await;
        assert_eq!(outcome.unwrap_err().code, "Timeout");
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn drain_with_disconnect_resolves_every_entry() {
        let table = std::sync::Arc::new(CallTable::new(TokioScheduler));
        let id_a = table.allocate_id();
        let id_b = table.allocate_id();
        let wait_a = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(id_a, Duration::from_secs(5)).await })
        };
        let wait_b = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(id_b, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        table.drain_with_disconnect();
        assert_eq!(wait_a.await.unwrap().unwrap_err().code, "Disconnected");
        assert_eq!(wait_b.await.unwrap().unwrap_err().code, "Disconnected");
    }

    #[tokio::test]
    async fn deliver_on_unknown_id_is_a_no_op() {
        let table = CallTable::new(TokioScheduler);
        table.deliver(999, Ok(json!(null)));
    }
}
