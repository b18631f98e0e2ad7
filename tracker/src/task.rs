use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fragment::{Fragment, FragmentId, FragmentMut, FragmentState};
use crate::JobId;

pub type TaskId = String;

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Identificador devuelto por [`Task::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Notificaciones que emite una tarea. Siempre se despachan con el lock liberado.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    FragmentChanged(FragmentChange),
    /// `is_done` pasó de false a true. Se emite una sola vez por tarea.
    Completed { task_id: TaskId },
    DescriptionChanged {
        task_id: TaskId,
        old: Option<String>,
        new: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FragmentChange {
    pub task_id: TaskId,
    /// Copia del fragmento justo después del cambio.
    pub fragment: Fragment,
    pub old: FragmentState,
    pub new: FragmentState,
}

impl FragmentChange {
    /// Transición aceptada que no cambió el estado (sólo tag / timestamp).
    pub fn is_unchanged(&self) -> bool {
        self.old == self.new
    }
}

/// Filtro de candidatos para [`Task::pick_with`].
#[derive(Debug, Clone, Default)]
pub struct PickFilter {
    except: HashSet<FragmentId>,
    target: Option<FragmentState>,
}

impl PickFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Excluye estos ids de los candidatos.
    pub fn except<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FragmentId>,
    {
        self.except.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sólo fragmentos que estén exactamente en `state`.
    pub fn target(mut self, state: FragmentState) -> Self {
        self.target = Some(state);
        self
    }

    fn admits(&self, fragment: &Fragment) -> bool {
        if self.except.contains(fragment.id()) {
            return false;
        }
        match self.target {
            Some(state) => fragment.state() == state,
            None => fragment.state().is_waiting(),
        }
    }
}

/// Conteo de fragmentos por estado.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub working: usize,
    pub success: usize,
    pub failure: usize,
    pub retrying: usize,
    pub fatal: usize,
    pub ignored: usize,
}

impl TaskSummary {
    fn from_fragments(fragments: &[Fragment]) -> Self {
        let mut summary = TaskSummary {
            total: fragments.len(),
            ..Default::default()
        };
        for fragment in fragments {
            match fragment.state() {
                FragmentState::Pending => summary.pending += 1,
                FragmentState::Working => summary.working += 1,
                FragmentState::Success => summary.success += 1,
                FragmentState::Failure => summary.failure += 1,
                FragmentState::Retrying => summary.retrying += 1,
                FragmentState::Fatal => summary.fatal += 1,
                FragmentState::Ignored => summary.ignored += 1,
            }
        }
        summary
    }

    pub fn done(&self) -> usize {
        self.success + self.fatal + self.ignored
    }

    pub fn errors(&self) -> usize {
        self.failure + self.fatal
    }

    /// Porcentaje de fragmentos en estado terminal (100 si no hay fragmentos).
    pub fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.done() as f64 / self.total as f64) * 100.0
    }
}

struct Inner {
    fragments: Vec<Fragment>,
    description: Option<String>,
    // ya se emitió Completed
    completed: bool,
}

impl Inner {
    fn all_done(&self) -> bool {
        self.fragments.iter().all(|f| f.state().is_done())
    }

    /// true sólo la primera vez que se observa la tarea terminada.
    fn mark_completed(&mut self) -> bool {
        if self.completed || !self.all_done() {
            return false;
        }
        self.completed = true;
        true
    }
}

/// Conjunto fijo y ordenado de fragmentos de un job, con sus operaciones
/// de reparto (pick), reporte (update_fragment) y cancelación.
///
/// Un único mutex cubre la decisión y la mutación de cada operación; los
/// callbacks del llamador corren dentro de esa región, los listeners fuera.
pub struct Task {
    id: TaskId,
    job_id: JobId,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl Task {
    /// Tarea con `count` fragmentos nuevos en `Pending`, índices 0..count.
    pub fn new(job_id: impl Into<JobId>, count: usize) -> Self {
        let fragments = (0..count).map(Fragment::new).collect();
        Self::from_fragments(job_id, fragments)
    }

    /// Adopta una secuencia de fragmentos ya construida (se respeta el orden dado).
    pub fn from_fragments(job_id: impl Into<JobId>, fragments: Vec<Fragment>) -> Self {
        Self::restore(
            uuid::Uuid::new_v4().to_string(),
            job_id,
            Utc::now(),
            None,
            fragments,
        )
    }

    pub(crate) fn restore(
        id: impl Into<TaskId>,
        job_id: impl Into<JobId>,
        created_at: DateTime<Utc>,
        description: Option<String>,
        fragments: Vec<Fragment>,
    ) -> Self {
        let mut inner = Inner {
            fragments,
            description,
            completed: false,
        };
        // una tarea que nace terminada no tiene flanco de completado
        inner.completed = inner.all_done();

        Self {
            id: id.into(),
            job_id: job_id.into(),
            created_at,
            inner: Mutex::new(inner),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.lock().description = Some(description.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // ninguna sección crítica deja los datos a medias, así que un lock
        // envenenado se puede seguir usando
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /* ---------------- suscripciones ---------------- */

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    fn emit(&self, events: Vec<TaskEvent>) {
        if events.is_empty() {
            return;
        }
        // copia de la lista: un listener puede (des)suscribirse sin bloquearse
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for event in &events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn change(&self, fragment: Fragment, old: FragmentState) -> TaskEvent {
        TaskEvent::FragmentChanged(FragmentChange {
            task_id: self.id.clone(),
            new: fragment.state(),
            fragment,
            old,
        })
    }

    fn finish(&self, mut events: Vec<TaskEvent>, completed: bool) {
        if completed {
            info!(task_id = %self.id, job_id = %self.job_id, "tarea completada");
            events.push(TaskEvent::Completed {
                task_id: self.id.clone(),
            });
        }
        self.emit(events);
    }

    /* ---------------- pick ---------------- */

    /// Reserva el primer fragmento en `Pending` o `Failure`.
    pub fn pick(&self) -> Option<Fragment> {
        self.pick_with(&PickFilter::default(), |_| {})
    }

    /// Igual que [`Task::pick`] pero deja `tag` marcado en el fragmento reservado.
    pub fn pick_tagged(&self, tag: &str) -> Option<Fragment> {
        self.pick_with(&PickFilter::default(), |f| f.set_tag(tag))
    }

    /// Selecciona y reserva un fragmento de forma atómica.
    ///
    /// `Pending` pasa a `Working` y `Failure` a `Retrying`; cualquier otro
    /// estado (sólo alcanzable con `target`) se deja igual. `on_picked`
    /// corre con el lock tomado.
    pub fn pick_with<F>(&self, filter: &PickFilter, on_picked: F) -> Option<Fragment>
    where
        F: FnOnce(&mut FragmentMut<'_>),
    {
        let (picked, old, completed) = {
            let mut inner = self.lock();
            let pos = inner.fragments.iter().position(|f| filter.admits(f))?;

            let fragment = &mut inner.fragments[pos];
            let old = fragment.state();
            let next = match old {
                FragmentState::Pending => FragmentState::Working,
                FragmentState::Failure => FragmentState::Retrying,
                other => other,
            };
            fragment.transition(next);
            on_picked(&mut FragmentMut::new(fragment));
            let picked = fragment.clone();

            (picked, old, inner.mark_completed())
        };

        debug!(
            task_id = %self.id,
            fragment = %picked.id(),
            index = picked.index(),
            from = %old,
            to = %picked.state(),
            "fragmento asignado"
        );

        self.finish(vec![self.change(picked.clone(), old)], completed);
        Some(picked)
    }

    /* ---------------- update ---------------- */

    pub fn update_fragment(&self, id: &str, state: Option<FragmentState>) -> bool {
        self.update_fragment_with(id, state, |_| {})
    }

    /// Reporta el resultado de un fragmento.
    ///
    /// Devuelve false si el id no existe, si el fragmento ya es terminal o
    /// si se pide `Pending` desde algo que no sea `Working`. `Working` y
    /// `Retrying` se normalizan según el estado previo. Sin `state` sólo se
    /// refresca `modification` y corre el callback.
    pub fn update_fragment_with<F>(&self, id: &str, state: Option<FragmentState>, callback: F) -> bool
    where
        F: FnOnce(&mut FragmentMut<'_>),
    {
        self.apply_update(id, state, |_| true, callback)
    }

    /// Como [`Task::update_fragment`], pero sólo si `guard` acepta el
    /// fragmento actual. `guard` se evalúa con el lock tomado, así que sirve
    /// para comprobar quién es el dueño del reclamo (por ejemplo su tag).
    pub fn update_fragment_if<G>(&self, id: &str, state: Option<FragmentState>, guard: G) -> bool
    where
        G: FnOnce(&Fragment) -> bool,
    {
        self.apply_update(id, state, guard, |_| {})
    }

    fn apply_update<G, F>(&self, id: &str, state: Option<FragmentState>, guard: G, callback: F) -> bool
    where
        G: FnOnce(&Fragment) -> bool,
        F: FnOnce(&mut FragmentMut<'_>),
    {
        let (updated, old, completed) = {
            let mut inner = self.lock();
            let Some(fragment) = inner.fragments.iter_mut().find(|f| f.id() == id) else {
                debug!(task_id = %self.id, fragment = %id, "update de fragmento desconocido");
                return false;
            };

            if !guard(&*fragment) {
                debug!(task_id = %self.id, fragment = %id, tag = ?fragment.tag(), "update rechazado por la guarda");
                return false;
            }

            let old = fragment.state();
            if old.is_done() {
                warn!(task_id = %self.id, fragment = %id, state = %old, "fragmento terminal, update rechazado");
                return false;
            }

            match state.filter(|requested| *requested != old) {
                Some(requested) => {
                    let next = match requested {
                        FragmentState::Pending if old == FragmentState::Working => {
                            FragmentState::Pending
                        }
                        FragmentState::Pending => {
                            warn!(task_id = %self.id, fragment = %id, from = %old, "vuelta a pending rechazada");
                            return false;
                        }
                        FragmentState::Working | FragmentState::Retrying => {
                            if old == FragmentState::Pending {
                                FragmentState::Working
                            } else {
                                FragmentState::Retrying
                            }
                        }
                        other => other,
                    };
                    fragment.transition(next);
                }
                None => fragment.touch(),
            }

            callback(&mut FragmentMut::new(fragment));
            let updated = fragment.clone();

            (updated, old, inner.mark_completed())
        };

        debug!(
            task_id = %self.id,
            fragment = %updated.id(),
            from = %old,
            to = %updated.state(),
            "fragmento actualizado"
        );

        self.finish(vec![self.change(updated, old)], completed);
        true
    }

    /* ---------------- cancel ---------------- */

    /// Pasa a `Ignored` todo fragmento no terminal. Devuelve cuántos cambiaron.
    pub fn cancel(&self) -> usize {
        let (changes, completed) = {
            let mut inner = self.lock();
            let changes: Vec<(Fragment, FragmentState)> = inner
                .fragments
                .iter_mut()
                .filter(|f| !f.state().is_done())
                .map(|f| {
                    let old = f.state();
                    f.transition(FragmentState::Ignored);
                    (f.clone(), old)
                })
                .collect();

            (changes, inner.mark_completed())
        };

        if changes.is_empty() {
            return 0;
        }

        let affected = changes.len();
        info!(task_id = %self.id, affected, "tarea cancelada");

        let events = changes
            .into_iter()
            .map(|(fragment, old)| self.change(fragment, old))
            .collect();
        self.finish(events, completed);
        affected
    }

    /* ---------------- descripción ---------------- */

    pub fn description(&self) -> Option<String> {
        self.lock().description.clone()
    }

    /// Cambia la descripción; notifica sólo si el valor cambió.
    pub fn set_description(&self, description: Option<String>) -> bool {
        let old = {
            let mut inner = self.lock();
            if inner.description == description {
                return false;
            }
            std::mem::replace(&mut inner.description, description.clone())
        };

        self.emit(vec![TaskEvent::DescriptionChanged {
            task_id: self.id.clone(),
            old,
            new: description,
        }]);
        true
    }

    /* ---------------- consultas ---------------- */

    fn select<P>(&self, predicate: P) -> Vec<Fragment>
    where
        P: Fn(&Fragment) -> bool,
    {
        self.lock()
            .fragments
            .iter()
            .filter(|f| predicate(f))
            .cloned()
            .collect()
    }

    pub fn fragments(&self) -> Vec<Fragment> {
        self.select(|_| true)
    }

    pub fn in_states(&self, states: &[FragmentState]) -> Vec<Fragment> {
        self.select(|f| states.contains(&f.state()))
    }

    pub fn processing(&self) -> Vec<Fragment> {
        self.select(|f| f.state().is_processing())
    }

    pub fn waiting(&self) -> Vec<Fragment> {
        self.select(|f| f.state().is_waiting())
    }

    pub fn done(&self) -> Vec<Fragment> {
        self.select(|f| f.state().is_done())
    }

    pub fn errors(&self) -> Vec<Fragment> {
        self.select(|f| f.state().is_error())
    }

    /// Búsqueda por id que falla si el fragmento no existe.
    pub fn get(&self, id: &str) -> Result<Fragment> {
        self.try_get(id)
            .ok_or_else(|| Error::FragmentNotFound(id.to_string()))
    }

    pub fn try_get(&self, id: &str) -> Option<Fragment> {
        self.lock().fragments.iter().find(|f| f.id() == id).cloned()
    }

    /// Puede devolver varios si la tarea adoptó fragmentos con índices repetidos.
    pub fn by_index(&self, index: usize) -> Vec<Fragment> {
        self.select(|f| f.index() == index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().fragments.iter().any(|f| f.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self) -> bool {
        self.lock().all_done()
    }

    /// Máxima `modification` de los fragmentos; nunca anterior a `created_at`.
    pub fn modification(&self) -> DateTime<Utc> {
        self.lock()
            .fragments
            .iter()
            .map(Fragment::modification)
            .fold(self.created_at, |latest, m| latest.max(m))
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary::from_fragments(&self.lock().fragments)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("summary", &self.summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(task: &Task) -> Arc<Mutex<Vec<TaskEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        task.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn completions(events: &Mutex<Vec<TaskEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TaskEvent::Completed { .. }))
            .count()
    }

    #[test]
    fn tarea_nueva_tiene_fragmentos_pending_ordenados() {
        let task = Task::new("job-1", 3);
        let fragments = task.fragments();

        assert_eq!(fragments.len(), 3);
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.index(), i);
            assert_eq!(f.state(), FragmentState::Pending);
        }
        assert!(!task.is_done());
        assert_eq!(task.job_id(), "job-1");
    }

    #[test]
    fn picks_sucesivos_avanzan_por_indice() {
        let task = Task::new("job-1", 3);

        let first = task.pick().unwrap();
        let second = task.pick().unwrap();

        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(task.get(first.id()).unwrap().state(), FragmentState::Working);
        assert_eq!(task.get(second.id()).unwrap().state(), FragmentState::Working);
    }

    #[test]
    fn fallo_y_pick_pasa_a_retrying() {
        let task = Task::new("job-1", 3);
        let f0 = task.pick().unwrap();
        task.pick().unwrap();

        assert!(task.update_fragment(f0.id(), Some(FragmentState::Failure)));
        let again = task.pick().unwrap();

        assert_eq!(again.id(), f0.id());
        assert_eq!(again.state(), FragmentState::Retrying);
    }

    #[test]
    fn pick_sin_candidatos_devuelve_none() {
        let task = Task::new("job-1", 1);
        assert!(task.pick().is_some());
        assert!(task.pick().is_none());
    }

    #[test]
    fn pick_respeta_excluidos() {
        let task = Task::new("job-1", 2);
        let ids: Vec<String> = task.fragments().iter().map(|f| f.id().to_string()).collect();

        let picked = task
            .pick_with(&PickFilter::new().except([ids[0].clone()]), |_| {})
            .unwrap();
        assert_eq!(picked.index(), 1);

        assert!(task
            .pick_with(&PickFilter::new().except([ids[0].clone()]), |_| {})
            .is_none());
    }

    #[test]
    fn pick_con_estado_objetivo_no_fuerza_transicion() {
        let task = Task::new("job-1", 2);
        let f0 = task.pick().unwrap();
        task.update_fragment(f0.id(), Some(FragmentState::Success));

        let picked = task
            .pick_with(&PickFilter::new().target(FragmentState::Success), |_| {})
            .unwrap();
        assert_eq!(picked.id(), f0.id());
        assert_eq!(picked.state(), FragmentState::Success);

        assert!(task
            .pick_with(&PickFilter::new().target(FragmentState::Fatal), |_| {})
            .is_none());
    }

    #[test]
    fn pick_tagged_marca_el_fragmento() {
        let task = Task::new("job-1", 1);
        let picked = task.pick_tagged("worker-7").unwrap();
        assert_eq!(picked.tag(), Some("worker-7"));
        assert_eq!(task.get(picked.id()).unwrap().tag(), Some("worker-7"));
    }

    #[test]
    fn update_rechaza_fragmentos_terminales() {
        let task = Task::new("job-1", 3);
        let ids: Vec<String> = task.fragments().iter().map(|f| f.id().to_string()).collect();

        task.update_fragment(&ids[0], Some(FragmentState::Success));
        task.update_fragment(&ids[1], Some(FragmentState::Fatal));
        task.update_fragment(&ids[2], Some(FragmentState::Ignored));

        for id in &ids {
            let before = task.get(id).unwrap();
            for state in FragmentState::ALL {
                assert!(!task.update_fragment(id, Some(state)));
            }
            assert!(!task.update_fragment(id, None));
            assert_eq!(task.get(id).unwrap(), before);
        }
    }

    #[test]
    fn update_de_id_desconocido_devuelve_false() {
        let task = Task::new("job-1", 1);
        assert!(!task.update_fragment("no-existe", Some(FragmentState::Success)));
    }

    #[test]
    fn pending_solo_se_acepta_desde_working() {
        let task = Task::new("job-1", 2);
        let f0 = task.pick().unwrap();

        assert!(task.update_fragment(f0.id(), Some(FragmentState::Pending)));
        assert_eq!(task.get(f0.id()).unwrap().state(), FragmentState::Pending);

        let f0 = task.pick().unwrap();
        task.update_fragment(f0.id(), Some(FragmentState::Failure));
        assert!(!task.update_fragment(f0.id(), Some(FragmentState::Pending)));
        assert_eq!(task.get(f0.id()).unwrap().state(), FragmentState::Failure);
    }

    #[test]
    fn working_y_retrying_se_normalizan() {
        let task = Task::new("job-1", 2);
        let ids: Vec<String> = task.fragments().iter().map(|f| f.id().to_string()).collect();

        // desde pending, pedir retrying termina en working
        assert!(task.update_fragment(&ids[0], Some(FragmentState::Retrying)));
        assert_eq!(task.get(&ids[0]).unwrap().state(), FragmentState::Working);

        // desde failure, pedir working termina en retrying
        task.update_fragment(&ids[1], Some(FragmentState::Failure));
        assert!(task.update_fragment(&ids[1], Some(FragmentState::Working)));
        assert_eq!(task.get(&ids[1]).unwrap().state(), FragmentState::Retrying);
    }

    #[test]
    fn update_sin_estado_solo_cambia_tag() {
        let task = Task::new("job-1", 1);
        let f0 = task.pick().unwrap();
        let events = recorder(&task);

        assert!(task.update_fragment_with(f0.id(), None, |f| f.set_tag("w-2")));

        let now = task.get(f0.id()).unwrap();
        assert_eq!(now.state(), FragmentState::Working);
        assert_eq!(now.tag(), Some("w-2"));
        assert!(now.modification() >= f0.modification());

        let events = events.lock().unwrap();
        match events.as_slice() {
            [TaskEvent::FragmentChanged(change)] => assert!(change.is_unchanged()),
            other => panic!("eventos inesperados: {other:?}"),
        }
    }

    #[test]
    fn completado_se_emite_una_sola_vez() {
        let task = Task::new("job-1", 3);
        let events = recorder(&task);
        let f0 = task.pick().unwrap();
        let f1 = task.pick().unwrap();
        let f2 = task.pick().unwrap();

        task.update_fragment(f1.id(), Some(FragmentState::Success));
        assert!(!task.is_done());
        task.update_fragment(f2.id(), Some(FragmentState::Success));
        assert!(!task.is_done());
        assert_eq!(completions(&events), 0);

        task.update_fragment(f0.id(), Some(FragmentState::Fatal));
        assert!(task.is_done());
        assert_eq!(completions(&events), 1);

        // operaciones posteriores no vuelven a emitirlo
        task.cancel();
        task.update_fragment(f0.id(), Some(FragmentState::Success));
        assert_eq!(completions(&events), 1);
    }

    #[test]
    fn completado_via_callback_de_pick() {
        let task = Task::new("job-1", 1);
        let events = recorder(&task);

        let picked = task
            .pick_with(&PickFilter::new(), |f| f.set_state(FragmentState::Success))
            .unwrap();

        assert_eq!(picked.state(), FragmentState::Success);
        assert!(task.is_done());
        assert_eq!(completions(&events), 1);
    }

    #[test]
    fn cancel_ignora_lo_pendiente_y_es_idempotente() {
        let task = Task::new("job-1", 3);
        let events = recorder(&task);
        let f0 = task.pick().unwrap();
        task.update_fragment(f0.id(), Some(FragmentState::Success));

        assert_eq!(task.cancel(), 2);
        assert!(task.is_done());
        assert_eq!(task.get(f0.id()).unwrap().state(), FragmentState::Success);
        assert_eq!(task.in_states(&[FragmentState::Ignored]).len(), 2);
        assert_eq!(completions(&events), 1);

        let before = events.lock().unwrap().len();
        assert_eq!(task.cancel(), 0);
        assert_eq!(events.lock().unwrap().len(), before);
    }

    #[test]
    fn cancel_notifica_cambios_antes_del_completado() {
        let task = Task::new("job-1", 2);
        let events = recorder(&task);
        task.cancel();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TaskEvent::FragmentChanged(_)));
        assert!(matches!(events[1], TaskEvent::FragmentChanged(_)));
        assert!(matches!(events[2], TaskEvent::Completed { .. }));
    }

    #[test]
    fn consultas_por_estado() {
        let task = Task::new("job-1", 5);
        let a = task.pick().unwrap();
        let b = task.pick().unwrap();
        let c = task.pick().unwrap();
        task.update_fragment(b.id(), Some(FragmentState::Failure));
        task.update_fragment(c.id(), Some(FragmentState::Fatal));

        assert_eq!(task.processing().len(), 1);
        assert_eq!(task.processing()[0].id(), a.id());
        assert_eq!(task.waiting().len(), 3); // 2 pending + 1 failure
        assert_eq!(task.done().len(), 1);
        assert_eq!(task.errors().len(), 2);

        let summary = task.summary();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.working, 1);
        assert_eq!(summary.failure, 1);
        assert_eq!(summary.fatal, 1);
        assert_eq!(summary.done(), 1);
        assert!((summary.progress_pct() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn get_falla_y_try_get_no() {
        let task = Task::new("job-1", 1);
        assert!(matches!(task.get("x"), Err(Error::FragmentNotFound(_))));
        assert!(task.try_get("x").is_none());
    }

    #[test]
    fn by_index_con_indices_repetidos() {
        let fragments = vec![
            Fragment::with_id("a", 0),
            Fragment::with_id("b", 1),
            Fragment::with_id("c", 1),
        ];
        let task = Task::from_fragments("job-1", fragments);

        let ones: Vec<String> = task.by_index(1).iter().map(|f| f.id().to_string()).collect();
        assert_eq!(ones, vec!["b", "c"]);
        assert!(task.by_index(5).is_empty());
    }

    #[test]
    fn update_if_respeta_al_dueno_del_reclamo() {
        let task = Task::new("job-1", 1);
        let first = task.pick_tagged("w#0").unwrap();

        // devuelto y vuelto a tomar por otro reclamo
        assert!(task.update_fragment_with(first.id(), Some(FragmentState::Pending), |f| f.clear_tag()));
        let second = task.pick_tagged("w#1").unwrap();
        assert_eq!(second.id(), first.id());

        let events = recorder(&task);
        assert!(!task.update_fragment_if(first.id(), Some(FragmentState::Fatal), |f| {
            f.tag() == Some("w#0")
        }));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(task.get(first.id()).unwrap().state(), FragmentState::Working);

        assert!(task.update_fragment_if(first.id(), Some(FragmentState::Success), |f| {
            f.tag() == Some("w#1")
        }));
        let now = task.get(first.id()).unwrap();
        assert_eq!(now.state(), FragmentState::Success);
        assert_eq!(now.tag(), Some("w#1"));
        assert_eq!(completions(&events), 1);
    }

    #[test]
    fn modification_nunca_es_anterior_a_created_at() {
        let task = Task::new("job-1", 3);
        assert!(task.modification() >= task.created_at());

        // fragmentos adoptados con marcas viejas
        let old = Utc::now() - chrono::Duration::hours(1);
        let fragments = vec![Fragment::restore("a", 0, FragmentState::Pending, None, old, old)];
        let adopted = Task::from_fragments("job-2", fragments);
        assert_eq!(adopted.modification(), adopted.created_at());
    }

    #[test]
    fn tarea_vacia_nace_terminada_sin_evento() {
        let task = Task::new("job-1", 0);
        let events = recorder(&task);
        assert!(task.is_done());
        assert_eq!(task.cancel(), 0);
        assert_eq!(completions(&events), 0);
        assert_eq!(task.modification(), task.created_at());
    }

    #[test]
    fn descripcion_notifica_solo_si_cambia() {
        let task = Task::new("job-1", 1).with_description("inicial");
        let events = recorder(&task);

        assert!(!task.set_description(Some("inicial".into())));
        assert!(task.set_description(Some("otra".into())));
        assert_eq!(task.description().as_deref(), Some("otra"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TaskEvent::DescriptionChanged { old, new, .. } => {
                assert_eq!(old.as_deref(), Some("inicial"));
                assert_eq!(new.as_deref(), Some("otra"));
            }
            other => panic!("evento inesperado: {other:?}"),
        }
    }

    #[test]
    fn listener_puede_operar_sobre_la_tarea_sin_deadlock() {
        let task = Arc::new(Task::new("job-1", 2));
        let seen = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&task);
        let counter = Arc::clone(&seen);
        task.subscribe(move |_| {
            if let Some(task) = weak.upgrade() {
                // consulta con el lock de estado ya liberado
                counter.store(task.processing().len(), Ordering::SeqCst);
            }
        });

        task.pick().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_corta_las_notificaciones() {
        let task = Task::new("job-1", 2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = task.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        task.pick();
        assert!(task.unsubscribe(sub));
        assert!(!task.unsubscribe(sub));
        task.pick();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn modification_es_el_maximo_de_los_fragmentos() {
        let task = Task::new("job-1", 2);
        let picked = task.pick().unwrap();
        assert_eq!(task.modification(), picked.modification().max(task.fragments()[1].modification()));
    }
}
