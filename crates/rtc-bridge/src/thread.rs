//! Engine threads
//!
//! The engine runs three long-lived threads: network (packet I/O and data
//! channel traffic), worker (stats gathering and other heavy lifting) and
//! signaling (SDP operations and peer connection callbacks). Each is a FIFO
//! task queue. Work is moved onto a thread with [`EngineThread::post`]; a
//! synchronous hop uses [`EngineThread::invoke`].

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadRole {
    Network,
    Worker,
    Signaling,
    /// Any thread not owned by the engine
    Foreign,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadRole::Network => "network",
            ThreadRole::Worker => "worker",
            ThreadRole::Signaling => "signaling",
            ThreadRole::Foreign => "foreign",
        };
        f.write_str(name)
    }
}

thread_local! {
    static CURRENT: Cell<Option<(u64, ThreadRole)>> = const { Cell::new(None) };
}

/// Role of the calling thread within runtime `runtime_id`
pub fn current_role(runtime_id: u64) -> ThreadRole {
    match CURRENT.with(Cell::get) {
        Some((id, role)) if id == runtime_id => role,
        _ => ThreadRole::Foreign,
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

pub struct EngineThread {
    role: ThreadRole,
    runtime_id: u64,
    name: String,
    sender: Sender<Message>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EngineThread {
    pub(crate) fn spawn(runtime_id: u64, role: ThreadRole, name: String) -> Result<Arc<Self>> {
        let (sender, receiver) = channel::unbounded();
        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(runtime_id, role, thread_name, receiver))?;

        Ok(Arc::new(Self {
            role,
            runtime_id,
            name,
            sender,
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn role(&self) -> ThreadRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        current_role(self.runtime_id) == self.role
    }

    /// Queue `task`. Returns `false` if the thread has stopped, in which case
    /// the task is dropped without running.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.send(Message::Run(Box::new(task))) {
            Ok(()) => true,
            Err(rejected) => {
                trace!(thread = %self.name, "task posted to stopped thread");
                drop(rejected);
                false
            }
        }
    }

    /// Run `f` on this thread and wait for its result.
    ///
    /// Runs inline when already on this thread. Fails fast with
    /// [`Error::WrongThread`] when called from another engine thread of the
    /// same runtime, since blocking there can deadlock the engine.
    pub fn invoke<R, F>(&self, operation: &'static str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let current = current_role(self.runtime_id);
        if current != ThreadRole::Foreign {
            return Err(Error::WrongThread {
                operation,
                required: self.role,
                current,
            });
        }

        let (tx, rx) = channel::bounded(1);
        let posted = self.post(move || {
            let _ = tx.send(f());
        });
        if !posted {
            return Err(Error::runtime(format!(
                "{operation}: {} thread has stopped",
                self.role
            )));
        }
        rx.recv().map_err(|_| {
            Error::runtime(format!("{operation}: {} thread dropped the call", self.role))
        })
    }

    /// Stop the loop and join the thread. Tasks still queued are dropped.
    pub(crate) fn stop(&self) {
        let _ = self.sender.send(Message::Stop);
        let join = self.join.lock().take();
        if let Some(join) = join {
            if self.is_current() {
                // Stopping from inside the loop; it exits after this task.
                return;
            }
            if join.join().is_err() {
                error!(thread = %self.name, "engine thread panicked during shutdown");
            }
        }
    }
}

impl fmt::Debug for EngineThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineThread")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish()
    }
}

fn run_loop(runtime_id: u64, role: ThreadRole, name: String, receiver: Receiver<Message>) {
    CURRENT.with(|current| current.set(Some((runtime_id, role))));
    debug!(thread = %name, "engine thread started");

    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(thread = %name, "engine task panicked");
                }
            }
            Message::Stop => break,
        }
    }

    // Dropping queued tasks fires their abandoned completions on this thread.
    let mut drained = 0usize;
    while let Ok(message) = receiver.try_recv() {
        drop(message);
        drained += 1;
    }
    CURRENT.with(|current| current.set(None));
    debug!(thread = %name, drained, "engine thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_TEST_RUNTIME: AtomicU64 = AtomicU64::new(1 << 40);

    fn spawn(role: ThreadRole) -> Arc<EngineThread> {
        let id = NEXT_TEST_RUNTIME.fetch_add(1, Ordering::Relaxed);
        EngineThread::spawn(id, role, format!("test-{role}")).unwrap()
    }

    #[test]
    fn test_invoke_from_foreign_thread() {
        let signaling = spawn(ThreadRole::Signaling);
        let role = signaling
            .invoke("role", {
                let signaling = signaling.clone();
                move || (signaling.is_current(), thread::current().name().map(String::from))
            })
            .unwrap();
        assert_eq!(role, (true, Some("test-signaling".to_string())));
        assert!(!signaling.is_current());
        signaling.stop();
    }

    #[test]
    fn test_invoke_inline_on_same_thread() {
        let worker = spawn(ThreadRole::Worker);
        let inner = worker.clone();
        let nested = worker
            .invoke("outer", move || inner.invoke("inner", || 5).unwrap())
            .unwrap();
        assert_eq!(nested, 5);
        worker.stop();
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let network = spawn(ThreadRole::Network);
        network.stop();
        assert!(!network.post(|| {}));
        assert!(matches!(
            network.invoke("late", || ()),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn test_task_panic_keeps_thread_alive() {
        let worker = spawn(ThreadRole::Worker);
        worker.post(|| panic!("task failure"));
        assert_eq!(worker.invoke("after panic", || 1).unwrap(), 1);
        worker.stop();
    }
}
