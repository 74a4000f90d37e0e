//! Closed-loop worker-count control for rate mode.
//!
//! One calibration unit estimates a single worker's throughput and sizes
//! the initial pool. After a warmup, a PID-style loop compares the measured
//! request rate (averaged across the 2 s and 5 s counters: the short window
//! reacts, the long one smooths) against the target and spawns or sheds
//! workers, with hysteresis so one-worker wobbles are ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::WaitGroup;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::WorkCtx;
use crate::requests::RequestContext;
use crate::worker::{spawn_rps_worker, WorkReporter};

const WARMUP: Duration = Duration::from_secs(5);
const DT_SECS: f64 = 5.0;
const KP: f64 = 5.0;
const KI: f64 = 3.0;
const KD: f64 = 3.0;

/// Initial worker count from one calibrated unit:
/// `max(1, ceil(target / measured))`. A unit that issued no requests (or
/// finished too fast to time) calibrates to a single worker.
pub fn initial_workers(rps_target: f64, unit_requests: u64, unit_wall: Duration) -> usize {
    let secs = unit_wall.as_secs_f64();
    if unit_requests == 0 || secs <= 0.0 {
        return 1;
    }
    let measured = unit_requests as f64 / secs;
    ((rps_target / measured).ceil() as usize).max(1)
}

/// Worker population that would hit the target at the measured per-worker
/// rate: `max(1, ceil(live * target / measured))`.
pub fn worker_goal(live: usize, rps_target: f64, rps_measured: f64) -> usize {
    if rps_measured <= 0.0 {
        return live.max(1);
    }
    ((live as f64 * rps_target / rps_measured).ceil() as usize).max(1)
}

/// PID accumulator across control ticks.
#[derive(Default)]
pub struct PidState {
    integral: f64,
    prev_error: f64,
}

impl PidState {
    /// One tick: returns the signed worker-count change before hysteresis.
    pub fn update(&mut self, live: usize, goal: usize) -> i64 {
        let error = goal as f64 - live as f64;
        self.integral += error * DT_SECS;
        let derivative = (error - self.prev_error) / DT_SECS;
        let output = KP * error + KI * self.integral + KD * derivative;
        self.prev_error = error;

        let new_workers = live as f64 * (1.0 + output / 100.0);
        new_workers.round() as i64 - live as i64
    }
}

/// Ignore single-worker adjustments so the pool does not flip-flop.
pub fn apply_hysteresis(diff: i64) -> i64 {
    if diff.abs() <= 1 {
        0
    } else {
        diff
    }
}

/// Sleep up to `d`, waking early on cancellation. Returns true when the
/// token fired.
fn wait_cancellable(token: &CancellationToken, d: Duration) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if token.is_cancelled() {
            return true;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return token.is_cancelled();
        }
        std::thread::sleep(left.min(Duration::from_millis(100)));
    }
}

pub struct RpsController {
    ctx: Arc<WorkCtx>,
    rps_target: f64,
    observe_only: bool,
}

impl RpsController {
    pub fn new(ctx: Arc<WorkCtx>, rps_target: f64, observe_only: bool) -> Self {
        RpsController {
            ctx,
            rps_target,
            observe_only,
        }
    }

    /// Run rate mode to completion: calibrate, spawn the initial pool,
    /// drive the control loop until stop, then wait for workers to drain.
    pub fn run(&self) {
        let (unit_requests, unit_wall) = self.calibrate();
        let unit_ms = unit_wall.as_millis() as f64;
        let workers = initial_workers(self.rps_target, unit_requests, unit_wall);
        if unit_requests == 0 {
            warn!("calibration unit issued no requests; starting a single worker");
        }
        info!(
            workers,
            target = self.rps_target,
            unit_requests,
            unit_secs = unit_wall.as_secs_f64(),
            "calibrated initial worker count"
        );

        // Statistics cover the steady run, not the calibration unit.
        self.ctx.state.reset_start();

        let wg = WaitGroup::new();
        for _ in 0..workers {
            spawn_rps_worker(&self.ctx, unit_ms, &wg);
        }

        self.control_loop(unit_ms, &wg);
        wg.wait();
    }

    /// Run one unit against a detached reporter and time it.
    fn calibrate(&self) -> (u64, Duration) {
        let (reporter, _rx) = WorkReporter::detached();
        let reporter = Arc::new(reporter);
        let rcx = RequestContext {
            cancel: self.ctx.state.stop.clone(),
            client: self.ctx.client.clone(),
            reporter: reporter.clone(),
            user_agent: self.ctx.user_agent.clone(),
        };
        let scope = self.ctx.engine.new_scope();

        let start = Instant::now();
        if let Err(err) = self.ctx.engine.run_unit(&scope, &rcx) {
            warn!(error = %err, "calibration unit failed");
        }
        (reporter.count(), start.elapsed())
    }

    fn control_loop(&self, unit_ms: f64, wg: &WaitGroup) {
        let stop = &self.ctx.state.stop;
        if wait_cancellable(stop, WARMUP) {
            return;
        }

        let mut pid = PidState::default();
        loop {
            if wait_cancellable(stop, Duration::from_secs_f64(DT_SECS)) {
                return;
            }

            let rps_short = self.ctx.state.counter2s.rate() as f64 / 2.0;
            let rps_long = self.ctx.state.counter5s.rate() as f64 / 5.0;
            let measured = (rps_short + rps_long) / 2.0;
            if measured <= 0.0 {
                debug!("no traffic measured this tick");
                continue;
            }

            let live = self.ctx.state.live_workers();
            let goal = worker_goal(live, self.rps_target, measured);
            let diff = apply_hysteresis(pid.update(live, goal));
            info!(
                rps = format!("{measured:.1}"),
                live, goal, diff, "control tick"
            );

            if diff == 0 || self.observe_only {
                continue;
            }
            if diff > 0 {
                debug!(count = diff, "spawning workers");
                for _ in 0..diff {
                    spawn_rps_worker(&self.ctx, unit_ms, wg);
                }
            } else {
                // The pool never drops below one worker while running.
                let shed = (-diff).min(live as i64 - 1).max(0);
                debug!(count = shed, "shedding workers");
                for _ in 0..shed {
                    let _ = self.ctx.state.worker_stop_tx.send(());
                }
            }
        }
    }
}
