//! Run orchestration.
//!
//! [`Work`] owns the lifecycle of one run: Init (channels, counters, start
//! instant), Running (reporter thread plus the fixed-N worker or the rate
//! controller), Draining (workers exited, result channel closed), Done
//! (reporter drained, statistics finalized).

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::{ClientConfig, HttpClient};
use crate::config::{OutputMode, WorkSpec};
use crate::controller::RpsController;
use crate::ratecounter::RateCounter;
use crate::report::{run_reporter, RunStats};
use crate::result::CallResult;
use crate::script::ScriptEngine;
use crate::worker::run_worker;

/// Buffered capacity of the result channel. Exhausting it blocks workers,
/// which only happens when the reporter has effectively stalled.
const MAX_RESULTS: usize = 1_000_000;

/// Mutable state shared by the orchestrator, workers, and controller.
pub struct WorkState {
    start: Mutex<Instant>,
    results_tx: Mutex<Option<Sender<CallResult>>>,
    pub stop: CancellationToken,
    pub worker_stop_tx: Sender<()>,
    pub worker_stop_rx: Receiver<()>,
    pub worker_count: AtomicI64,
    pub counter2s: Arc<RateCounter>,
    pub counter5s: Arc<RateCounter>,
}

impl WorkState {
    fn new(start: Instant, results_tx: Sender<CallResult>) -> Self {
        let (worker_stop_tx, worker_stop_rx) = unbounded();
        WorkState {
            start: Mutex::new(start),
            results_tx: Mutex::new(Some(results_tx)),
            stop: CancellationToken::new(),
            worker_stop_tx,
            worker_stop_rx,
            worker_count: AtomicI64::new(0),
            counter2s: Arc::new(RateCounter::new(Duration::from_secs(2))),
            counter5s: Arc::new(RateCounter::new(Duration::from_secs(5))),
        }
    }

    /// A sender for a worker's reporter. Panics after the channel is
    /// closed; workers are only started while the run is live.
    pub fn results_sender(&self) -> Sender<CallResult> {
        self.results_tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("result channel already closed")
            .clone()
    }

    /// Drop the orchestrator's sender. Once every worker exits, the channel
    /// closes and the reporter drains out. Called exactly once.
    fn close_results(&self) {
        self.results_tx.lock().unwrap().take();
    }

    /// Restart the statistics clock (rate mode does this after calibration).
    pub fn reset_start(&self) {
        *self.start.lock().unwrap() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start.lock().unwrap().elapsed()
    }

    pub fn live_workers(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst).max(0) as usize
    }
}

/// Everything a worker needs to run units.
pub struct WorkCtx {
    pub engine: Arc<ScriptEngine>,
    pub client: Arc<HttpClient>,
    pub state: Arc<WorkState>,
    pub user_agent: String,
}

/// One configured run.
pub struct Work {
    n: u64,
    rps: u64,
    output: OutputMode,
    observe_only: bool,
    ctx: Arc<WorkCtx>,
    results_rx: Option<Receiver<CallResult>>,
    writer: Option<Box<dyn Write + Send>>,
}

impl Work {
    pub fn new(mut spec: WorkSpec, engine: ScriptEngine, handle: Handle) -> Work {
        let start = Instant::now();
        let (results_tx, results_rx) = bounded(MAX_RESULTS);
        let state = Arc::new(WorkState::new(start, results_tx));

        let client = HttpClient::new(
            ClientConfig {
                timeout: spec.timeout,
                h2: spec.h2,
                disable_compression: spec.disable_compression,
                disable_keepalive: spec.disable_keepalive,
                proxy: spec.proxy.clone(),
                headers: std::mem::take(&mut spec.headers),
            },
            handle,
            start,
        );

        Work {
            n: spec.n,
            rps: spec.rps,
            output: spec.output,
            observe_only: spec.observe_only,
            ctx: Arc::new(WorkCtx {
                engine: Arc::new(engine),
                client: Arc::new(client),
                state,
                user_agent: spec.user_agent,
            }),
            results_rx: Some(results_rx),
            writer: spec.writer.take(),
        }
    }

    /// Token that stops the run when cancelled (signal handler, timer).
    pub fn stop_token(&self) -> CancellationToken {
        self.ctx.state.stop.clone()
    }

    /// Run to completion and return the final statistics. Blocks the
    /// calling thread.
    pub fn run(mut self) -> RunStats {
        let results_rx = self.results_rx.take().expect("run called twice");
        let writer = self
            .writer
            .take()
            .unwrap_or_else(|| Box::new(std::io::stdout()));
        let output = self.output;
        let reporter = std::thread::spawn(move || run_reporter(results_rx, output, writer));

        if self.n > 0 {
            self.run_fixed();
        } else {
            self.run_rps();
        }

        // Draining: workers are gone; compute the total before waiting on
        // the reporter so its drain time is not billed to the run.
        let total = self.ctx.state.elapsed();
        self.ctx.state.close_results();
        let data = reporter.join().expect("reporter thread panicked");

        info!(total_secs = total.as_secs_f64(), "run complete");
        data.finalize(total)
    }

    /// Fixed-N mode: a single worker by construction; concurrency comes
    /// from how many requests each script unit issues.
    fn run_fixed(&self) {
        let ctx = Arc::clone(&self.ctx);
        let n = self.n;
        let worker = std::thread::spawn(move || run_worker(&ctx, Some(n)));
        let _ = worker.join();
    }

    fn run_rps(&self) {
        let controller = RpsController::new(
            Arc::clone(&self.ctx),
            self.rps as f64,
            self.observe_only,
        );
        controller.run();
    }
}
