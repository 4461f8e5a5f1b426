//! Explicit engine lifecycle.
//!
//! [`RtcRuntime`] owns the three engine threads. Every live runtime also
//! holds a share of the process-wide [`Subsystem`] guard, which is
//! initialized by the first runtime and torn down after the last one is gone.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::thread::{current_role, EngineThread, ThreadRole};

static SUBSYSTEM: Mutex<Weak<Subsystem>> = Mutex::new(Weak::new());
static SUBSYSTEM_GENERATION: AtomicU64 = AtomicU64::new(0);
static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide engine state shared by all live runtimes
#[derive(Debug)]
pub struct Subsystem {
    generation: u64,
    started_at: Instant,
}

impl Subsystem {
    fn acquire() -> Arc<Subsystem> {
        let mut slot = SUBSYSTEM.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.upgrade() {
            return existing;
        }

        let generation = SUBSYSTEM_GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "RTC subsystem initialized");
        let subsystem = Arc::new(Subsystem {
            generation,
            started_at: Instant::now(),
        });
        *slot = Arc::downgrade(&subsystem);
        subsystem
    }

    /// Incremented each time the subsystem is brought up from scratch
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Subsystem {
    fn drop(&mut self) {
        info!(
            generation = self.generation,
            uptime_ms = self.started_at.elapsed().as_millis() as u64,
            "RTC subsystem torn down"
        );
    }
}

struct RuntimeInner {
    id: u64,
    network: Arc<EngineThread>,
    worker: Arc<EngineThread>,
    signaling: Arc<EngineThread>,
    stopped: AtomicBool,
    subsystem: Arc<Subsystem>,
}

impl RuntimeInner {
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(runtime = self.id, "stopping engine threads");
        self.signaling.stop();
        self.worker.stop();
        self.network.stop();
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running set of engine threads. Cheap to clone.
#[derive(Clone)]
pub struct RtcRuntime {
    inner: Arc<RuntimeInner>,
}

impl RtcRuntime {
    pub fn start(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let subsystem = Subsystem::acquire();
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let prefix = &config.thread_name_prefix;

        let network = EngineThread::spawn(id, ThreadRole::Network, format!("{prefix}-network"))?;
        let worker = EngineThread::spawn(id, ThreadRole::Worker, format!("{prefix}-worker"))?;
        let signaling =
            EngineThread::spawn(id, ThreadRole::Signaling, format!("{prefix}-signaling"))?;

        info!(runtime = id, subsystem = subsystem.generation(), "RTC runtime started");
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                id,
                network,
                worker,
                signaling,
                stopped: AtomicBool::new(false),
                subsystem,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn network(&self) -> &Arc<EngineThread> {
        &self.inner.network
    }

    pub fn worker(&self) -> &Arc<EngineThread> {
        &self.inner.worker
    }

    pub fn signaling(&self) -> &Arc<EngineThread> {
        &self.inner.signaling
    }

    pub fn thread(&self, role: ThreadRole) -> Option<&Arc<EngineThread>> {
        match role {
            ThreadRole::Network => Some(self.network()),
            ThreadRole::Worker => Some(self.worker()),
            ThreadRole::Signaling => Some(self.signaling()),
            ThreadRole::Foreign => None,
        }
    }

    /// Role of the calling thread with respect to this runtime
    pub fn current_role(&self) -> ThreadRole {
        current_role(self.inner.id)
    }

    pub fn subsystem(&self) -> &Arc<Subsystem> {
        &self.inner.subsystem
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop signaling, worker, then network. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for RtcRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRuntime")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::error::{Error, RtcErrorKind};

    fn runtime() -> RtcRuntime {
        RtcRuntime::start(&BridgeConfig::default()).unwrap()
    }

    #[test]
    fn test_live_runtimes_share_subsystem() {
        let first = runtime();
        let second = runtime();
        assert!(Arc::ptr_eq(first.subsystem(), second.subsystem()));
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_thread_names_and_roles() {
        let runtime = runtime();
        let probe = runtime.clone();
        let (role, name) = runtime
            .worker()
            .invoke("probe", move || {
                (probe.current_role(), std::thread::current().name().map(String::from))
            })
            .unwrap();
        assert_eq!(role, ThreadRole::Worker);
        assert_eq!(name.as_deref(), Some("rtc-worker"));
        assert_eq!(runtime.current_role(), ThreadRole::Foreign);
    }

    #[test]
    fn test_blocking_call_from_other_engine_thread_fails_fast() {
        let runtime = runtime();
        let target = runtime.signaling().clone();
        let result = runtime
            .network()
            .invoke("hop", move || target.invoke("close", || ()))
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::WrongThread {
                operation: "close",
                required: ThreadRole::Signaling,
                current: ThreadRole::Network,
            })
        ));
    }

    #[test]
    fn test_shutdown_abandons_queued_completions() {
        let runtime = runtime();
        runtime.shutdown();
        assert!(!runtime.is_running());

        let (completion, mut rx) = Completion::<()>::channel("late");
        let posted = runtime.signaling().post(move || completion.succeed(()));
        assert!(!posted);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), RtcErrorKind::InternalError);

        runtime.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BridgeConfig {
            thread_name_prefix: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            RtcRuntime::start(&config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
