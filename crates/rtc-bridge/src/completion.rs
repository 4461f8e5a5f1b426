//! Single-shot completion adapters for asynchronous engine operations.
//!
//! A [`Completion`] is created by the caller-facing side of an operation and
//! handed to the engine, which resolves it from whichever thread the work
//! finishes on. Resolution consumes the value, so a completion cannot fire
//! twice; dropping it unresolved fires a single
//! [`RtcErrorKind::InternalError`] "abandoned" failure instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{RtcError, RtcErrorKind};

/// Outcome delivered to a completion callback
pub type CompletionResult<T> = std::result::Result<T, RtcError>;

type Callback<T> = Box<dyn FnOnce(CompletionResult<T>) + Send + 'static>;

static NEXT_COMPLETION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Completion<T> {
    operation: &'static str,
    id: u64,
    callback: Option<Callback<T>>,
}

impl<T> Completion<T> {
    pub fn new<F>(operation: &'static str, callback: F) -> Self
    where
        F: FnOnce(CompletionResult<T>) + Send + 'static,
    {
        let id = NEXT_COMPLETION_ID.fetch_add(1, Ordering::Relaxed);
        trace!(operation, id, "completion created");
        Self {
            operation,
            id,
            callback: Some(Box::new(callback)),
        }
    }

    /// Completion that forwards its outcome to a oneshot receiver, for Rust
    /// callers that want to `.await` the result.
    pub fn channel(operation: &'static str) -> (Self, oneshot::Receiver<CompletionResult<T>>)
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(operation, move |result| {
            // Receiver dropped means the caller stopped waiting.
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: RtcError) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, result: CompletionResult<T>) {
        if let Some(callback) = self.callback.take() {
            trace!(
                operation = self.operation,
                id = self.id,
                ok = result.is_ok(),
                "completion resolved"
            );
            callback(result);
        }
    }

    /// Adapt the success payload while keeping the same callback
    pub fn map<U, F>(mut self, f: F) -> Completion<U>
    where
        T: 'static,
        U: 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        let operation = self.operation;
        let id = self.id;
        let callback = self.callback.take();
        Completion {
            operation,
            id,
            callback: callback.map(|callback| {
                Box::new(move |result: CompletionResult<U>| callback(result.map(f))) as Callback<U>
            }),
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(
                operation = self.operation,
                id = self.id,
                "completion dropped before the engine resolved it"
            );
            callback(Err(RtcError::new(
                RtcErrorKind::InternalError,
                format!("{} abandoned before completion", self.operation),
            )));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("operation", &self.operation)
            .field("id", &self.id)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(calls: &Arc<AtomicUsize>) -> Completion<u32> {
        let calls = calls.clone();
        Completion::new("test", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_success_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        counting(&calls).succeed(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_delivers_abandoned_failure() {
        let (completion, mut rx) = Completion::<u32>::channel("create_offer");
        drop(completion);

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), RtcErrorKind::InternalError);
        assert!(err.message().contains("create_offer"));
    }

    #[test]
    fn test_resolved_completion_does_not_fire_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let completion = counting(&calls);
        completion.fail(RtcError::invalid_state("closed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_from_other_thread() {
        let (completion, rx) = Completion::<String>::channel("test");
        std::thread::spawn(move || completion.succeed("done".to_string()));
        assert_eq!(rx.await.unwrap().unwrap(), "done");
    }

    #[test]
    fn test_map_keeps_identity() {
        let (completion, mut rx) = Completion::<String>::channel("describe");
        let id = completion.id();
        let mapped: Completion<usize> = completion.map(|n: usize| n.to_string());
        assert_eq!(mapped.id(), id);
        mapped.succeed(5);
        assert_eq!(rx.try_recv().unwrap().unwrap(), "5");
    }
}
