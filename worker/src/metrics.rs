use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracker::FragmentState;

/// Contadores del worker; se comparten entre el pool y el supervisor.
#[derive(Debug, Default)]
pub struct Metrics {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    fatal: AtomicU64,
    requeued: AtomicU64,
    total_task_time_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_fatal: u64,
    pub requeued: u64,
    pub avg_task_ms: Option<f64>,
}

impl Metrics {
    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Registra el resultado reportado de un fragmento.
    pub fn record_outcome(&self, state: FragmentState, elapsed: Duration) {
        let counter = match state {
            FragmentState::Success => {
                let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                self.total_task_time_ms.fetch_add(ms, Ordering::Relaxed);
                &self.succeeded
            }
            FragmentState::Failure => &self.failed,
            FragmentState::Fatal => &self.fatal,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, n: usize) {
        self.requeued.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        // promedio sólo sobre las exitosas
        let avg_task_ms = (succeeded > 0).then(|| {
            self.total_task_time_ms.load(Ordering::Relaxed) as f64 / succeeded as f64
        });

        MetricsSnapshot {
            tasks_started: self.started.load(Ordering::Relaxed),
            tasks_succeeded: succeeded,
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_fatal: self.fatal.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            avg_task_ms,
        }
    }
}
