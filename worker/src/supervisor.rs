use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time::interval};
use tracing::{debug, info, warn};
use tracker::{Container, FragmentState};

use crate::config::Config;
use crate::metrics::Metrics;

/// Tolerancia a fallos del pool: fragmentos que llevan demasiado tiempo
/// en proceso sin cambios se devuelven para que otro slot los tome.
pub struct Supervisor {
    container: Container,
    group: String,
    stale_after: Duration,
    sweep_every: Duration,
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(container: Container, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            container,
            group: config.group.clone(),
            stale_after: config.stale_after,
            sweep_every: config.sweep_every,
            metrics,
        }
    }

    /// Loop de chequeo hasta que llegue `shutdown`.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut ticker = interval(self.sweep_every);
        // el primer tick es inmediato
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = shutdown.notified() => {
                    info!(group = %self.group, "supervisor detenido");
                    break;
                }
            }
        }
    }

    /// Una pasada: `Working` vuelve a `Pending` y `Retrying` a `Failure`.
    /// Devuelve cuántos fragmentos se devolvieron.
    pub fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let mut requeued = 0;

        for task in self.container.list(&self.group) {
            for fragment in task.processing() {
                // modification en el futuro cuenta como recién tocado
                let idle_for = (now - fragment.modification())
                    .to_std()
                    .unwrap_or_default();
                if idle_for < self.stale_after {
                    continue;
                }

                let back = match fragment.state() {
                    FragmentState::Working => FragmentState::Pending,
                    _ => FragmentState::Failure,
                };

                // sin tag, un reporte tardío del reclamo viejo ya no coincide;
                // si el dueño reportó mientras tanto el update se rechaza
                if task.update_fragment_with(fragment.id(), Some(back), |f| f.clear_tag()) {
                    warn!(
                        task_id = task.id(),
                        fragment = fragment.id(),
                        tag = fragment.tag().unwrap_or("-"),
                        ?idle_for,
                        to = %back,
                        "fragmento trabado, devuelto"
                    );
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            self.metrics.record_requeued(requeued);
        } else {
            debug!(group = %self.group, "sweep sin fragmentos trabados");
        }
        requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(container: &Container, stale_after: Duration) -> Supervisor {
        let config = Config {
            group: "g".to_string(),
            stale_after,
            sweep_every: Duration::from_millis(10),
            ..Config::default()
        };
        Supervisor::new(container.clone(), &config, Arc::new(Metrics::default()))
    }

    #[test]
    fn devuelve_fragmentos_trabados() {
        let container = Container::new();
        let task = container.create("g", "job-1", 3);

        let working = task.pick_tagged("w#0").unwrap();
        let retrying = task.pick_tagged("w#1").unwrap();
        task.update_fragment(retrying.id(), Some(FragmentState::Failure));
        let retrying = task.pick_tagged("w#2").unwrap();
        assert_eq!(retrying.state(), FragmentState::Retrying);

        let sup = supervisor(&container, Duration::ZERO);
        assert_eq!(sup.sweep_once(), 2);

        assert_eq!(task.get(working.id()).unwrap().state(), FragmentState::Pending);
        assert_eq!(task.get(retrying.id()).unwrap().state(), FragmentState::Failure);
        assert_eq!(sup.metrics.snapshot().requeued, 2);
        assert!(task.processing().is_empty());
        assert!(task.get(working.id()).unwrap().tag().is_none());
        assert!(task.get(retrying.id()).unwrap().tag().is_none());
    }

    #[test]
    fn no_toca_fragmentos_recientes() {
        let container = Container::new();
        let task = container.create("g", "job-1", 2);
        let f = task.pick().unwrap();

        let sup = supervisor(&container, Duration::from_secs(3600));
        assert_eq!(sup.sweep_once(), 0);
        assert_eq!(task.get(f.id()).unwrap().state(), FragmentState::Working);
    }

    #[tokio::test]
    async fn run_termina_con_shutdown() {
        let container = Container::new();
        let task = container.create("g", "job-1", 1);
        task.pick().unwrap();

        let sup = Arc::new(supervisor(&container, Duration::ZERO));
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn({
            let sup = Arc::clone(&sup);
            let shutdown = Arc::clone(&shutdown);
            async move { sup.run(shutdown).await }
        });

        // dejamos pasar al menos un tick
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        handle.await.unwrap();

        assert_eq!(task.waiting().len(), 1);
        assert!(sup.metrics.snapshot().requeued >= 1);
    }
}
