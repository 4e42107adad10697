//! Engine - Self-rescheduling tick loop over a fixed set of processes
//!
//! A tick sleeps for `timing`, runs every registered process if the engine
//! is still started, then schedules the next tick. `stop()` never cancels a
//! tick that is already running; the loop just does not come back.

pub mod process;

pub use process::Process;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How processes within one tick relate to each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Each process is awaited before the next one starts
    #[default]
    Sequential,
    /// All processes are spawned at once, nobody waits
    Concurrent,
}

struct Shared {
    timing: Duration,
    mode: ExecutionMode,
    started: AtomicBool,
    processes: RwLock<Vec<Process>>,
    ticks: AtomicU64,
    /// Whether a loop task exists. Only touched under this lock so a
    /// stopping loop and a restarting caller agree on who owns the loop.
    looping: Mutex<bool>,
}

/// Timer-driven process scheduler
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(timing: Duration, mode: ExecutionMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                timing,
                mode,
                started: AtomicBool::new(false),
                processes: RwLock::new(Vec::new()),
                ticks: AtomicU64::new(0),
                looping: Mutex::new(false),
            }),
        }
    }

    /// Register `processes` (first non-empty registration wins) and start
    /// ticking. Returns false only when no Tokio runtime is available.
    pub fn start(&self, processes: Vec<Process>) -> bool {
        {
            let mut registered = self.shared.processes.write();
            if registered.is_empty() {
                *registered = processes;
            } else if !processes.is_empty() {
                debug!(
                    registered = registered.len(),
                    ignored = processes.len(),
                    "engine already has processes, ignoring new list"
                );
            }
        }

        let mut looping = self.shared.looping.lock();
        self.shared.started.store(true, Ordering::SeqCst);
        if *looping {
            return true;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "engine needs a tokio runtime to start");
                self.shared.started.store(false, Ordering::SeqCst);
                return false;
            }
        };

        *looping = true;
        runtime.spawn(run_loop(Arc::clone(&self.shared)));
        true
    }

    /// Stop scheduling ticks. Returns the new started state (false).
    pub fn stop(&self) -> bool {
        self.shared.started.store(false, Ordering::SeqCst);
        false
    }

    /// Run one tick right now, whether started or not.
    pub async fn run_once(&self) {
        execute(&self.shared).await;
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn timing(&self) -> Duration {
        self.shared.timing
    }

    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    pub fn process_count(&self) -> usize {
        self.shared.processes.read().len()
    }

    /// Ticks completed by the loop (manual `run_once` calls not counted).
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Duration::from_millis(10_000), ExecutionMode::Sequential)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(shared.timing).await;

        if !shared.started.load(Ordering::SeqCst) {
            if release_loop(&shared) {
                debug!("engine stopped");
                return;
            }
            continue;
        }

        execute(&shared).await;
        shared.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Give up the loop unless the engine was restarted while we slept.
fn release_loop(shared: &Shared) -> bool {
    let mut looping = shared.looping.lock();
    if shared.started.load(Ordering::SeqCst) {
        return false;
    }
    *looping = false;
    true
}

async fn execute(shared: &Shared) {
    let processes = shared.processes.read().clone();

    match shared.mode {
        ExecutionMode::Sequential => {
            for process in &processes {
                run_guarded(process).await;
            }
        }
        ExecutionMode::Concurrent => {
            for process in processes {
                tokio::spawn(async move { run_guarded(&process).await });
            }
        }
    }
}

/// A failing or panicking process is logged and never takes its siblings
/// or the loop down with it.
async fn run_guarded(process: &Process) {
    match AssertUnwindSafe(process.run()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(process = process.name(), error = %e, "process failed"),
        Err(_) => error!(process = process.name(), "process panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, Result};
    use std::sync::atomic::AtomicU64;

    async fn count(counter: Arc<AtomicU64>, _: ()) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fail(_: Arc<AtomicU64>, _: ()) -> Result<()> {
        Err(Error::Exchange("boom".to_string()))
    }

    async fn explode(_: Arc<AtomicU64>, _: ()) -> Result<()> {
        panic!("process blew up");
    }

    #[test]
    fn test_defaults() {
        let engine = Engine::default();
        assert_eq!(engine.timing(), Duration::from_secs(10));
        assert_eq!(engine.mode(), ExecutionMode::Sequential);
        assert!(!engine.is_started());
        assert_eq!(engine.process_count(), 0);
    }

    #[test]
    fn test_start_without_runtime_reports_failure() {
        let engine = Engine::new(Duration::from_millis(10), ExecutionMode::Sequential);
        assert!(!engine.start(vec![]));
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn test_start_runs_processes_every_tick() {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_millis(20), ExecutionMode::Sequential);

        assert!(engine.start(vec![Process::bind("count", count, counter.clone(), ())]));
        assert!(engine.is_started());
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.stop();

        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert!(engine.ticks() >= 2);
    }

    #[tokio::test]
    async fn test_stop_before_first_tick_runs_nothing() {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_millis(30), ExecutionMode::Sequential);

        engine.start(vec![Process::bind("count", count, counter.clone(), ())]);
        assert!(!engine.stop());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_secs(60), ExecutionMode::Sequential);

        engine.start(vec![Process::bind("first", count, first.clone(), ())]);
        engine.start(vec![
            Process::bind("second", count, second.clone(), ()),
            Process::bind("second", count, second.clone(), ()),
        ]);
        assert_eq!(engine.process_count(), 1);

        engine.run_once().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_start_still_succeeds() {
        let engine = Engine::new(Duration::from_millis(10), ExecutionMode::Sequential);
        assert!(engine.start(vec![]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.ticks() >= 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_starve_siblings() {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_secs(60), ExecutionMode::Sequential);

        engine.start(vec![
            Process::bind("fail", fail, counter.clone(), ()),
            Process::bind("explode", explode, counter.clone(), ()),
            Process::bind("count", count, counter.clone(), ()),
        ]);
        engine.run_once().await;
        engine.run_once().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_mode_launches_all() {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_millis(20), ExecutionMode::Concurrent);

        engine.start(vec![
            Process::bind("explode", explode, counter.clone(), ()),
            Process::bind("a", count, counter.clone(), ()),
            Process::bind("b", count, counter.clone(), ()),
        ]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert_eq!(counter.load(Ordering::SeqCst) % 2, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = Engine::new(Duration::from_millis(20), ExecutionMode::Sequential);

        engine.start(vec![Process::bind("count", count, counter.clone(), ())]);
        engine.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let before = counter.load(Ordering::SeqCst);

        assert!(engine.start(vec![]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();

        assert!(counter.load(Ordering::SeqCst) > before);
    }
}
