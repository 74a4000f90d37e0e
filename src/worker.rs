//! Worker loop and per-worker reporting.
//!
//! A worker is an OS thread that repeatedly runs script units until the
//! broadcast stop fires, a single-worker stop message is drained, or the
//! fixed-unit budget is spent. Each worker owns a [`WorkReporter`] that
//! counts request starts (feeding the rate counters) and forwards results
//! to the shared channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use tracing::{debug, error};

use crate::executor::WorkCtx;
use crate::ratecounter::RateCounter;
use crate::report::Reporter;
use crate::requests::RequestContext;
use crate::result::CallResult;

/// Capacity of a detached reporter's throwaway channel.
const DETACHED_CAPACITY: usize = 1_000_000;

/// Per-worker bookkeeping: counts request starts into the shared rate
/// counters and forwards finished results.
pub struct WorkReporter {
    counter2s: Arc<RateCounter>,
    counter5s: Arc<RateCounter>,
    results: Sender<CallResult>,
    count: AtomicU64,
}

impl WorkReporter {
    pub fn new(
        counter2s: Arc<RateCounter>,
        counter5s: Arc<RateCounter>,
        results: Sender<CallResult>,
    ) -> Self {
        WorkReporter {
            counter2s,
            counter5s,
            results,
            count: AtomicU64::new(0),
        }
    }

    /// A reporter wired to its own throwaway channel, used for the
    /// calibration unit so its results stay out of the run's statistics.
    /// The receiver must stay alive for the reporter's lifetime.
    pub fn detached() -> (Self, Receiver<CallResult>) {
        let (tx, rx) = bounded(DETACHED_CAPACITY);
        let reporter = WorkReporter::new(
            Arc::new(RateCounter::new(Duration::from_secs(2))),
            Arc::new(RateCounter::new(Duration::from_secs(5))),
            tx,
        );
        (reporter, rx)
    }

    /// Requests started through this reporter.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Reporter for WorkReporter {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.counter2s.incr();
        self.counter5s.incr();
    }

    fn finish(&self, result: CallResult) {
        let _ = self.results.send(result);
    }
}

/// Run script units until stopped. `limit` bounds the number of units in
/// fixed-N mode; `None` runs until a stop signal. Returns the number of
/// HTTP requests the worker issued.
pub fn run_worker(ctx: &WorkCtx, limit: Option<u64>) -> u64 {
    let reporter = Arc::new(WorkReporter::new(
        ctx.state.counter2s.clone(),
        ctx.state.counter5s.clone(),
        ctx.state.results_sender(),
    ));
    let rcx = RequestContext {
        cancel: ctx.state.stop.clone(),
        client: ctx.client.clone(),
        reporter: reporter.clone(),
        user_agent: ctx.user_agent.clone(),
    };
    // The scope lives as long as the worker, so ctx.vars carries script
    // state from one unit to the next.
    let scope = ctx.engine.new_scope();

    let mut units = 0u64;
    loop {
        if let Some(n) = limit {
            if units >= n {
                break;
            }
        }
        if ctx.state.stop.is_cancelled() {
            break;
        }
        if ctx.state.worker_stop_rx.try_recv().is_ok() {
            debug!("worker shed by controller");
            break;
        }
        if let Err(err) = ctx.engine.run_unit(&scope, &rcx) {
            // Unit failures are logged and the run continues; only load-time
            // errors abort the process.
            error!(error = %err, "script unit failed");
        }
        units += 1;
    }
    reporter.count()
}

/// Spawn one rate-mode worker thread. The worker jitters its start by a
/// uniform sleep in `[0, 1.2 * unit_ms)` so the initial cohort does not run
/// in lock-step, and maintains the live worker count around its loop.
pub fn spawn_rps_worker(ctx: &Arc<WorkCtx>, unit_ms: f64, wg: &WaitGroup) {
    let ctx = Arc::clone(ctx);
    let wg = wg.clone();
    std::thread::spawn(move || {
        ctx.state.worker_count.fetch_add(1, Ordering::SeqCst);

        let max_sleep = (unit_ms * 1.2).ceil();
        let jitter = rand::random::<f64>() * max_sleep;
        std::thread::sleep(Duration::from_millis(jitter.ceil() as u64));

        run_worker(&ctx, None);

        ctx.state.worker_count.fetch_sub(1, Ordering::SeqCst);
        drop(wg);
    });
}
