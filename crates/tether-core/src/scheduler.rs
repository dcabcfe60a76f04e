//! Periodic scheduler collaborator.
//!
//! The engines schedule their sweeps (pending-call expiry, server liveness)
//! through this trait rather than spawning timers themselves, so a host can
//! substitute its own scheduling. The contract: the action first runs no
//! sooner than `due` after scheduling, then approximately every `period`,
//! and two invocations of one action never overlap.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

/// A recurring action. Runs to completion on every tick.
pub type ScheduledAction = Box<dyn FnMut() + Send>;

pub trait Scheduler: Send + Sync {
    /// Run `action` after `due`, then every `period`, until the returned
    /// handle is cancelled or dropped.
    fn schedule(&self, action: ScheduledAction, due: Duration, period: Duration) -> ScheduledTask;
}

/// Handle to a scheduled action. Cancels on drop.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: tokio::task::JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Scheduler backed by the tokio timer.
///
/// Each schedule runs inside a single spawned task, which serializes ticks
/// by construction. A panicking action is caught and logged; the schedule
/// continues on the next tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(
        &self,
        mut action: ScheduledAction,
        due: Duration,
        period: Duration,
    ) -> ScheduledTask {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + due;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if std::panic::catch_unwind(AssertUnwindSafe(&mut action)).is_err() {
                    tracing::error!("scheduled action panicked; continuing schedule");
                }
            }
        });
        ScheduledTask { handle }
    }
}
