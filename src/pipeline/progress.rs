use crate::pipeline::reconcile::ReconcileTally;
use crate::protocol::{collected_line, emit, metrics_line, progress_line, MetricsEvent, ProgressEvent};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How often the latest progress is printed for the orchestrator
pub const TICK: Duration = Duration::from_secs(2);

#[derive(Default)]
struct BoardState {
    latest: Option<ProgressEvent>,
    pending: bool,
    metrics: MetricsEvent,
    collected: u32,
}

/// Latest progress and final counters, shared between the pipeline and the ticker
#[derive(Clone, Default)]
pub struct ProgressBoard {
    state: Arc<Mutex<BoardState>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut state = self.lock();
        state.latest = Some(event);
        state.pending = true;
    }

    /// Latest event not printed yet
    pub fn take_pending(&self) -> Option<ProgressEvent> {
        let mut state = self.lock();
        if !state.pending {
            return None;
        }
        state.pending = false;
        state.latest.clone()
    }

    pub fn set_cooldown(&self, hours: u32) {
        self.lock().metrics.cooldown_hours = hours;
    }

    pub fn record_metrics(&self, tally: &ReconcileTally) {
        let mut state = self.lock();
        state.metrics.created = tally.created;
        state.metrics.updated = tally.updated;
        state.metrics.skipped_recent = tally.skipped_recent;
    }

    pub fn set_collected(&self, collected: u32) {
        self.lock().collected = collected;
    }

    /// Lines printed once the pipeline is over, whatever the outcome
    pub fn final_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(3);
        if let Some(event) = self.take_pending() {
            lines.push(progress_line(&event));
        }
        let state = self.lock();
        lines.push(metrics_line(&state.metrics));
        lines.push(collected_line(state.collected));
        lines
    }
}

#[cfg(test)]
impl ProgressBoard {
    pub fn latest(&self) -> Option<ProgressEvent> {
        self.lock().latest.clone()
    }

    pub fn metrics(&self) -> MetricsEvent {
        self.lock().metrics
    }
}

/// Print pending progress every `period` until aborted
pub fn spawn_ticker(board: ProgressBoard, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if let Some(event) = board.take_pending() {
                emit(&progress_line(&event));
            }
        }
    })
}
