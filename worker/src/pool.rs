use anyhow::Result;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, info, warn};
use tracker::{Container, Fragment, FragmentId, FragmentState, Task, TaskFragment, TaskId, WorkerId};

use crate::config::Config;
use crate::metrics::{Metrics, MetricsSnapshot};

/// Trabajo real sobre un fragmento. Corre en un hilo de bloqueo.
pub type Handler = Arc<dyn Fn(&Fragment) -> Result<()> + Send + Sync>;

// lo que necesita cada fragmento en vuelo
struct Shared {
    group: String,
    max_attempts: u32,
    handler: Handler,
    metrics: Arc<Metrics>,
    // intentos por tarea y fragmento; se poda junto con las tareas
    attempts: Mutex<HashMap<TaskId, HashMap<FragmentId, u32>>>,
}

impl Shared {
    fn bump_attempt(&self, task_id: &str, fragment_id: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let n = attempts
            .entry(task_id.to_string())
            .or_default()
            .entry(fragment_id.to_string())
            .or_insert(0);
        *n += 1;
        *n
    }

    fn forget(&self, task_id: &str, fragment_id: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fragments) = attempts.get_mut(task_id) {
            fragments.remove(fragment_id);
            if fragments.is_empty() {
                attempts.remove(task_id);
            }
        }
    }

    /// Descarta los contadores de tareas que ya no están vivas en el grupo
    /// (terminadas, canceladas o sacadas). Devuelve cuántas tareas se podaron.
    fn prune(&self, live: &HashSet<String>) -> usize {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let before = attempts.len();
        attempts.retain(|task_id, _| live.contains(task_id));
        before - attempts.len()
    }

    fn tracked_tasks(&self) -> usize {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Pool de slots que toma fragmentos de un grupo del contenedor
/// y los procesa con hasta `concurrency` en paralelo.
pub struct Pool {
    container: Container,
    worker_id: WorkerId,
    concurrency: usize,
    idle: Duration,
    next_claim: AtomicU64,
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(container: Container, config: &Config, worker_id: impl Into<WorkerId>, handler: Handler) -> Self {
        Self {
            container,
            worker_id: worker_id.into(),
            concurrency: config.concurrency.max(1),
            idle: config.idle,
            next_claim: AtomicU64::new(0),
            shared: Arc::new(Shared {
                group: config.group.clone(),
                max_attempts: config.max_attempts.max(1),
                handler,
                metrics: Arc::new(Metrics::default()),
                attempts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    fn prune_attempts(&self) {
        let live: HashSet<String> = self
            .container
            .list(&self.shared.group)
            .iter()
            .map(|task| task.id().to_string())
            .collect();
        let pruned = self.shared.prune(&live);
        if pruned > 0 {
            debug!(pruned, "contadores de intentos descartados");
        }
    }

    // tag que queda en el fragmento: de qué worker y qué reclamo
    fn claim_tag(&self) -> String {
        let n = self.next_claim.fetch_add(1, Ordering::Relaxed);
        format!("{}#{}", self.worker_id, n)
    }

    /// Procesa fragmentos del grupo hasta que no queden tareas sin terminar
    /// ni trabajo en vuelo.
    pub async fn run_until_drained(&self) -> Result<MetricsSnapshot> {
        let group = &self.shared.group;
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            worker_id = %self.worker_id,
            group = %group,
            concurrency = self.concurrency,
            "pool arrancando"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                joined?;
            }
            self.prune_attempts();

            // sin slots libres esperamos a que termine alguno
            let permit = Arc::clone(&sem).acquire_owned().await?;

            let tag = self.claim_tag();
            let claim = self
                .container
                .pick_with(group, |_| true, |task| task.pick_tagged(&tag));

            match claim {
                Some(claim) => {
                    debug!(
                        task_id = claim.task.id(),
                        fragment = claim.fragment.id(),
                        state = %claim.fragment.state(),
                        tag = %tag,
                        "fragmento tomado"
                    );
                    in_flight.spawn(process(Arc::clone(&self.shared), claim, tag, permit));
                }
                None => {
                    drop(permit);
                    if in_flight.is_empty() && self.container.list(group).is_empty() {
                        break;
                    }
                    // nada disponible: esperamos a que termine algo o a que
                    // el supervisor devuelva fragmentos trabados
                    tokio::select! {
                        Some(joined) = in_flight.join_next() => joined?,
                        _ = sleep(self.idle) => {}
                    }
                }
            }
        }

        self.prune_attempts();
        let snapshot = self.shared.metrics.snapshot();
        info!(worker_id = %self.worker_id, group = %group, ?snapshot, "grupo drenado");
        Ok(snapshot)
    }
}

async fn process(shared: Arc<Shared>, claim: TaskFragment, tag: String, permit: OwnedSemaphorePermit) {
    let TaskFragment { task, fragment } = claim;
    let attempt = shared.bump_attempt(task.id(), fragment.id());
    shared.metrics.record_start();

    let started = Instant::now();
    let handler = Arc::clone(&shared.handler);
    let input = fragment.clone();
    let result = tokio::task::spawn_blocking(move || handler(&input)).await;
    let elapsed = started.elapsed();

    let outcome = match result {
        Ok(Ok(())) => FragmentState::Success,
        Ok(Err(e)) => {
            warn!(fragment = fragment.id(), attempt, "error procesando fragmento: {e:#}");
            failure_state(attempt, shared.max_attempts)
        }
        Err(e) => {
            warn!(fragment = fragment.id(), attempt, "panic o join error: {e:?}");
            failure_state(attempt, shared.max_attempts)
        }
    };

    if report(&task, fragment.id(), &tag, outcome) {
        shared.metrics.record_outcome(outcome, elapsed);
        info!(
            task_id = task.id(),
            fragment = fragment.id(),
            index = fragment.index(),
            attempt,
            ?elapsed,
            outcome = %outcome,
            "fragmento reportado"
        );
    } else {
        // el supervisor lo devolvió y ahora es de otro reclamo, o ya está terminal
        warn!(task_id = task.id(), fragment = fragment.id(), tag = %tag, "reporte rechazado");
    }

    if outcome.is_done() {
        shared.forget(task.id(), fragment.id());
    }

    drop(permit);
}

/// Reporta el resultado sólo si el fragmento sigue siendo de este reclamo.
fn report(task: &Task, fragment_id: &str, tag: &str, outcome: FragmentState) -> bool {
    task.update_fragment_if(fragment_id, Some(outcome), |f| f.tag() == Some(tag))
}

fn failure_state(attempt: u32, max_attempts: u32) -> FragmentState {
    if attempt < max_attempts {
        FragmentState::Failure
    } else {
        FragmentState::Fatal
    }
}
